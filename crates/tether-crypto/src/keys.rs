//! X25519 key pairs and Diffie-Hellman agreement.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

const KEY_BYTES: usize = 32;

fn decode_key(encoded: &str) -> Result<[u8; KEY_BYTES], CryptoError> {
    let mut bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKey)?;
    let out = <[u8; KEY_BYTES]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKey);
    bytes.zeroize();
    out
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        <[u8; KEY_BYTES]>::try_from(bytes)
            .map(Self::from_bytes)
            .map_err(|_| CryptoError::InvalidKey)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        decode_key(encoded).map(Self::from_bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        self.0.as_bytes()
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.as_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Private half of a key pair. Zeroized on drop, never printed.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_BYTES]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        <[u8; KEY_BYTES]>::try_from(bytes)
            .map(Self::from_bytes)
            .map_err(|_| CryptoError::InvalidKey)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let mut bytes = decode_key(encoded)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    pub fn to_bytes(&self) -> [u8; KEY_BYTES] {
        self.0.to_bytes()
    }

    pub fn to_base64(&self) -> String {
        let mut bytes = self.to_bytes();
        let encoded = STANDARD.encode(bytes);
        bytes.zeroize();
        encoded
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

#[derive(Clone, Debug)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = PrivateKey(StaticSecret::random_from_rng(OsRng));
        let public = private.public_key();
        Self { private, public }
    }
}

/// 32-byte output of a key agreement. Feed it through [`crate::hkdf`] before
/// using it as a content key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; KEY_BYTES]);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

/// X25519 agreement. Commutative: `derive(a, B) == derive(b, A)`.
///
/// Low-order peer keys, which would force an all-zero secret, are rejected.
pub fn derive_shared_secret(
    private: &PrivateKey,
    peer_public: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let shared = private.0.diffie_hellman(&peer_public.0);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey);
    }
    Ok(SharedSecret(*shared.as_bytes()))
}
