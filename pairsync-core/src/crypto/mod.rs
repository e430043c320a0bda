//! Cryptographic primitives used by pairing and sessions.
//!
//! This module provides:
//! - X25519 key agreement and HKDF-SHA256 key derivation
//! - AES-256-GCM sealing of small payloads under a derived key
//! - SHA-256 fingerprints and constant-time comparison
//! - Random identifiers suitable for one-time credentials

pub mod kex;
pub mod seal;

pub use kex::{derive_session_key, KeyExchangePair};
pub use seal::{open, seal, SessionKey};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Lowercase hex SHA-256 digest, used for certificate pinning.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Raw SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// Compare two fingerprints without leaking where they differ.
///
/// Case-insensitive so pins typed or scanned in uppercase still match.
pub fn fingerprints_match(expected: &str, presented: &str) -> bool {
    let expected = expected.to_ascii_lowercase();
    let presented = presented.to_ascii_lowercase();
    expected.len() == presented.len() && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// Fill an array from the OS random source.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Base64url (no padding) encoding used for values that travel in URLs and
/// bearer headers.
pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Inverse of [`encode_b64url`].
pub fn decode_b64url(s: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}
