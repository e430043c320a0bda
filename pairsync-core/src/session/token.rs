//! Bearer token wire format.
//!
//! ```text
//! <token_id>.<base64url(HMAC-SHA256(key, token_id))>
//! ```
//!
//! The MAC lets the desktop reject forged or mangled tokens before touching
//! the database.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use super::TokenError;
use crate::crypto::{decode_b64url, encode_b64url};

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies bearer strings.
#[derive(Clone)]
pub struct BearerSigner {
    mac: HmacSha256,
}

impl std::fmt::Debug for BearerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerSigner(..)")
    }
}

impl BearerSigner {
    /// Build a signer from the stored signing key.
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        let mac =
            <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TokenError::TokenInvalidSignature)?;
        Ok(Self { mac })
    }

    /// Produce the bearer string for a token id.
    pub fn sign(&self, token_id: &Uuid) -> String {
        let id = token_id.to_string();
        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        let tag = mac.finalize().into_bytes();
        format!("{}.{}", id, encode_b64url(&tag))
    }

    /// Check the MAC and return the token id it covers.
    pub fn verify(&self, bearer: &str) -> Result<Uuid, TokenError> {
        let (id, tag) = bearer
            .trim()
            .split_once('.')
            .ok_or(TokenError::TokenInvalidSignature)?;
        let token_id = Uuid::parse_str(id).map_err(|_| TokenError::TokenInvalidSignature)?;
        let tag = decode_b64url(tag).map_err(|_| TokenError::TokenInvalidSignature)?;

        let mut mac = self.mac.clone();
        mac.update(id.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| TokenError::TokenInvalidSignature)?;

        Ok(token_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> BearerSigner {
        BearerSigner::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn signed_bearer_verifies() {
        let id = Uuid::new_v4();
        let bearer = signer().sign(&id);
        assert!(bearer.starts_with(&id.to_string()));
        assert_eq!(signer().verify(&bearer).unwrap(), id);
    }

    #[test]
    fn other_key_rejects() {
        let bearer = signer().sign(&Uuid::new_v4());
        let other = BearerSigner::new(&[8u8; 32]).unwrap();
        assert_eq!(other.verify(&bearer), Err(TokenError::TokenInvalidSignature));
    }

    #[test]
    fn swapped_id_rejects() {
        let bearer = signer().sign(&Uuid::new_v4());
        let (_, tag) = bearer.split_once('.').unwrap();
        let forged = format!("{}.{}", Uuid::new_v4(), tag);
        assert_eq!(signer().verify(&forged), Err(TokenError::TokenInvalidSignature));
    }

    #[test]
    fn malformed_bearers_reject() {
        for bearer in ["", "no-dot", "not-a-uuid.AAAA", "00000000-0000-0000-0000-000000000000.***"] {
            assert_eq!(
                signer().verify(bearer),
                Err(TokenError::TokenInvalidSignature),
                "{}",
                bearer
            );
        }
    }
}
