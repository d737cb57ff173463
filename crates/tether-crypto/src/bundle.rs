//! Encrypted bundle wire format.
//!
//! ```text
//! v0: [0x00][nonce:12][ciphertext:N][tag:16]
//! v1: [0x01][key_version:2 BE][nonce:12][ciphertext:N][tag:16]
//! ```
//!
//! The version byte is self-describing, so v0 and v1 producers interoperate
//! without negotiation.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::nonce::{next_nonce, NONCE_LEN};

pub const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const VERSION_V0: u8 = 0x00;
const VERSION_V1: u8 = 0x01;
const KEY_VERSION_LEN: usize = 2;

const V0_HEADER: usize = 1;
const V1_HEADER: usize = 1 + KEY_VERSION_LEN;

/// Header of a bundle, readable without the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleInfo {
    pub format_version: u8,
    pub key_version: Option<u16>,
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey);
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)
}

fn seal(header: &[u8], plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let nonce_bytes = next_nonce().ok_or(CryptoError::EncryptionFailed)?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut bundle = Vec::with_capacity(header.len() + NONCE_LEN + sealed.len());
    bundle.extend_from_slice(header);
    bundle.extend_from_slice(&nonce_bytes);
    bundle.extend_from_slice(&sealed);
    Ok(bundle)
}

/// Encrypt `plaintext` with a 32-byte key into a v0 bundle.
///
/// Every call uses a fresh nonce, so identical inputs never produce identical
/// bundles.
pub fn encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    seal(&[VERSION_V0], plaintext, key)
}

/// Encrypt into a v1 bundle tagged with `key_version`.
pub fn encrypt_versioned(
    plaintext: &[u8],
    key: &[u8],
    key_version: u16,
) -> Result<Vec<u8>, CryptoError> {
    let [hi, lo] = key_version.to_be_bytes();
    seal(&[VERSION_V1, hi, lo], plaintext, key)
}

/// Open a v0 or v1 bundle. Either the whole plaintext is returned or an error;
/// authentication failures never yield partial output.
pub fn decrypt(bundle: &[u8], key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let version = *bundle.first().ok_or(CryptoError::InvalidBundle)?;
    let header_len = match version {
        VERSION_V0 => V0_HEADER,
        VERSION_V1 => V1_HEADER,
        other => return Err(CryptoError::UnsupportedFormat(other)),
    };
    if bundle.len() < header_len + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::InvalidBundle);
    }

    let (nonce_bytes, sealed) = bundle[header_len..].split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), sealed)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Inspect the header of `bundle`.
///
/// Returns `None` for empty input, for a v1 header too short to hold its key
/// version, or for an unknown version byte.
pub fn bundle_info(bundle: &[u8]) -> Option<BundleInfo> {
    match *bundle.first()? {
        VERSION_V0 => Some(BundleInfo {
            format_version: VERSION_V0,
            key_version: None,
        }),
        VERSION_V1 => {
            let raw = bundle.get(1..V1_HEADER)?;
            Some(BundleInfo {
                format_version: VERSION_V1,
                key_version: Some(u16::from_be_bytes([raw[0], raw[1]])),
            })
        }
        _ => None,
    }
}
