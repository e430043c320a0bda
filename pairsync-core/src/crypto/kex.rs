//! X25519 key agreement and HKDF derivation of the session-establishment key.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{sha256, CryptoError, Result, SessionKey};

const SESSION_KEY_INFO: &[u8] = b"pairsync-session-establishment-v1";

/// An X25519 key pair.
///
/// The desktop generates one per pairing ticket; the companion generates one
/// per pairing attempt. The secret half zeroizes on drop.
pub struct KeyExchangePair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyExchangePair {
    /// Generate a fresh key pair from the OS random source.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            got: bytes.len(),
        })?;
        let secret = StaticSecret::from(array);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// Public key bytes, safe to publish.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Secret key bytes, for persistence only.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Agree on a shared secret with `peer_public` and derive the
    /// session-establishment key bound to `ticket_value`.
    pub fn derive_session_key(&self, peer_public: &[u8], ticket_value: &[u8]) -> Result<SessionKey> {
        derive_session_key(&self.secret, peer_public, ticket_value)
    }
}

/// X25519 + HKDF-SHA256.
///
/// The salt is the SHA-256 of the ticket value, so both sides must hold the
/// same ticket to arrive at the same key. A peer key that yields a
/// non-contributory shared secret (low-order point) is rejected.
pub fn derive_session_key(
    secret: &StaticSecret,
    peer_public: &[u8],
    ticket_value: &[u8],
) -> Result<SessionKey> {
    let peer: [u8; 32] = peer_public.try_into().map_err(|_| {
        CryptoError::KeyExchangeFailed(format!(
            "peer public key must be 32 bytes, got {}",
            peer_public.len()
        ))
    })?;

    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(CryptoError::KeyExchangeFailed(
            "peer public key is a low-order point".to_string(),
        ));
    }

    let salt = sha256(ticket_value);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(SESSION_KEY_INFO, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;

    Ok(SessionKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_derive_the_same_key() {
        let desktop = KeyExchangePair::generate();
        let companion = KeyExchangePair::generate();
        let ticket = b"ticket-value";

        let k1 = desktop
            .derive_session_key(&companion.public_key_bytes(), ticket)
            .unwrap();
        let k2 = companion
            .derive_session_key(&desktop.public_key_bytes(), ticket)
            .unwrap();

        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn different_ticket_gives_different_key() {
        let desktop = KeyExchangePair::generate();
        let companion = KeyExchangePair::generate();

        let k1 = desktop
            .derive_session_key(&companion.public_key_bytes(), b"ticket-a")
            .unwrap();
        let k2 = desktop
            .derive_session_key(&companion.public_key_bytes(), b"ticket-b")
            .unwrap();

        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn low_order_point_is_rejected() {
        let desktop = KeyExchangePair::generate();
        let result = desktop.derive_session_key(&[0u8; 32], b"ticket");
        assert!(matches!(result, Err(CryptoError::KeyExchangeFailed(_))));
    }

    #[test]
    fn wrong_length_public_key_is_rejected() {
        let desktop = KeyExchangePair::generate();
        let result = desktop.derive_session_key(&[7u8; 31], b"ticket");
        assert!(matches!(result, Err(CryptoError::KeyExchangeFailed(_))));
    }

    #[test]
    fn secret_roundtrips_through_bytes() {
        let original = KeyExchangePair::generate();
        let restored = KeyExchangePair::from_secret_bytes(&original.secret_bytes()).unwrap();
        assert_eq!(original.public_key_bytes(), restored.public_key_bytes());

        assert!(matches!(
            KeyExchangePair::from_secret_bytes(&[1u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }
}
