//! AES-256-GCM sealing under a derived session key.
//!
//! Wire format: `nonce(12) || ciphertext || auth_tag(16)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{CryptoError, Result};

/// 32-byte symmetric key derived during pairing. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; 32],
}

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.is_empty() {
        return Err(CryptoError::EncryptionFailed(
            "Cannot seal empty payload".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; 12] = nonce.into();

    // aes-gcm appends the tag to the ciphertext
    let ciphertext_with_tag = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("Seal failed: {}", e)))?;

    let mut result = Vec::with_capacity(12 + ciphertext_with_tag.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext_with_tag);
    Ok(result)
}

/// Decrypt a blob produced by [`seal`].
pub fn open(key: &SessionKey, blob: &[u8]) -> Result<Vec<u8>> {
    // Minimum: 12 (nonce) + 1 (ciphertext) + 16 (tag) = 29 bytes
    if blob.len() < 29 {
        return Err(CryptoError::DecryptionFailed(
            "Sealed blob too short".to_string(),
        ));
    }

    let nonce_bytes: [u8; 12] = blob[..12]
        .try_into()
        .map_err(|_| CryptoError::DecryptionFailed("Invalid nonce length".to_string()))?;

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    cipher
        .decrypt(&Nonce::from(nonce_bytes), &blob[12..])
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    fn key() -> SessionKey {
        SessionKey::from_bytes(random_bytes())
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = key();
        let sealed = seal(&key, b"bearer token").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"bearer token".to_vec());
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(seal(&key(), b"").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&key(), b"secret").unwrap();
        assert_eq!(open(&key(), &sealed), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn tampered_blob_fails() {
        let key = key();
        let mut sealed = seal(&key, b"secret").unwrap();
        sealed[14] ^= 0xFF;
        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn short_blob_fails() {
        assert!(open(&key(), &[0u8; 28]).is_err());
    }

    #[test]
    fn debug_does_not_print_key() {
        let rendered = format!("{:?}", key());
        assert_eq!(rendered, "SessionKey(..)");
    }
}
