use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::CryptoError;

const HASH_LEN: usize = 32;
const MAX_OUTPUT: usize = 255 * HASH_LEN;

/// HKDF-SHA256 extract-and-expand.
///
/// An empty `salt` behaves as a zero-filled salt of hash length.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    if length == 0 || length > MAX_OUTPUT {
        return Err(CryptoError::InvalidLength);
    }
    let salt = (!salt.is_empty()).then_some(salt);
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::InvalidLength)?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = hkdf(b"ikm", b"salt", b"info", 32).unwrap();
        let b = hkdf(b"ikm", b"salt", b"info", 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn info_changes_output() {
        let a = hkdf(b"ikm", b"salt", b"tether/content", 32).unwrap();
        let b = hkdf(b"ikm", b"salt", b"tether/auth", 32).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn output_length_matches_request() {
        for len in [16, 32, 64] {
            assert_eq!(hkdf(b"ikm", b"", b"", len).unwrap().len(), len);
        }
    }

    #[test]
    fn empty_salt_equals_zero_salt() {
        let empty = hkdf(b"ikm", b"", b"info", 32).unwrap();
        let zeros = hkdf(b"ikm", &[0u8; 32], b"info", 32).unwrap();
        assert_eq!(empty, zeros);
    }

    #[test]
    fn rfc5869_case_1() {
        let ikm = [0x0b; 22];
        let salt: Vec<u8> = (0x00..=0x0c).collect();
        let info: Vec<u8> = (0xf0..=0xf9).collect();
        let okm = hkdf(&ikm, &salt, &info, 42).unwrap();
        let expected = "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865";
        let hex: String = okm.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(hex, expected);
    }

    #[test]
    fn out_of_range_lengths() {
        assert_eq!(hkdf(b"ikm", b"", b"", 0), Err(CryptoError::InvalidLength));
        assert_eq!(hkdf(b"ikm", b"", b"", 255 * 32 + 1), Err(CryptoError::InvalidLength));
        assert!(hkdf(b"ikm", b"", b"", 255 * 32).is_ok());
    }
}
