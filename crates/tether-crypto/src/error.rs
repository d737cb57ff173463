/// Failures from sealing, opening or deriving key material.
///
/// None of these are retryable with the same inputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,
    #[error("bundle is malformed or too short")]
    InvalidBundle,
    #[error("unsupported bundle format version {0:#04x}")]
    UnsupportedFormat(u8),
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("requested output length is out of range")]
    InvalidLength,
    #[error("encryption failed")]
    EncryptionFailed,
}

impl CryptoError {
    /// Stable classification string for logs and error payloads.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidKey => "INVALID_KEY",
            Self::InvalidBundle => "INVALID_BUNDLE",
            Self::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            Self::DecryptionFailed => "DECRYPTION_FAILED",
            Self::InvalidLength => "INVALID_LENGTH",
            Self::EncryptionFailed => "ENCRYPTION_FAILED",
        }
    }
}
