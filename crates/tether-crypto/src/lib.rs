//! # tether-crypto
//!
//! Authenticated encryption for payloads that cross the relay. The relay only
//! ever sees bundles produced here; it never holds a key.
//!
//! - [`bundle`]: AES-256-GCM sealing into the self-describing v0/v1 wire format
//! - [`keys`]: X25519 key pairs and shared-secret agreement
//! - [`kdf`]: HKDF-SHA256 expansion of shared secrets into content keys

pub mod bundle;
pub mod error;
pub mod kdf;
pub mod keys;
mod nonce;

pub use bundle::{bundle_info, decrypt, encrypt, encrypt_versioned, BundleInfo, KEY_LEN};
pub use error::CryptoError;
pub use kdf::hkdf;
pub use keys::{derive_shared_secret, KeyPair, PrivateKey, PublicKey, SharedSecret};
