//! Out-of-band bootstrap payload.
//!
//! The payload travels from the desktop to the companion through a channel
//! the user can see (typically a scanned code) and is encoded as
//!
//! ```text
//! pairsync://pair?d=<base64url(JSON)>
//! ```
//!
//! Rendering the code itself happens elsewhere.

use serde::{Deserialize, Serialize};

use super::PairingError;
use crate::ca::PinnedPeer;
use crate::crypto::{decode_b64url, encode_b64url};

/// Current payload format version.
pub const PAYLOAD_VERSION: u8 = 1;

const URI_PREFIX: &str = "pairsync://pair?d=";

/// Everything a companion needs to pair with one desktop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPayload {
    pub version: u8,
    /// One-time ticket value (base64url). Secret.
    pub ticket: String,
    /// Desktop X25519 public key bound to this ticket (base64url).
    pub desktop_public_key: String,
    pub ca_fingerprint: String,
    pub leaf_fingerprint: String,
    /// Plain endpoint serving the root certificate.
    pub bootstrap_url: String,
    /// Authenticated endpoint, secured by the pinned leaf.
    pub service_url: String,
    pub profile_scope: String,
    pub expires_at: i64,
}

impl std::fmt::Debug for BootstrapPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapPayload")
            .field("version", &self.version)
            .field("ca_fingerprint", &self.ca_fingerprint)
            .field("leaf_fingerprint", &self.leaf_fingerprint)
            .field("bootstrap_url", &self.bootstrap_url)
            .field("service_url", &self.service_url)
            .field("profile_scope", &self.profile_scope)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl BootstrapPayload {
    /// Encode as a `pairsync://` URI.
    pub fn to_uri(&self) -> Result<String, PairingError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| PairingError::InvalidPayload(format!("encode: {}", e)))?;
        Ok(format!("{}{}", URI_PREFIX, encode_b64url(&json)))
    }

    /// Decode a `pairsync://` URI.
    pub fn from_uri(uri: &str) -> Result<Self, PairingError> {
        let encoded = uri
            .trim()
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| PairingError::InvalidPayload("not a pairsync pairing URI".to_string()))?;
        let json = decode_b64url(encoded)
            .map_err(|e| PairingError::InvalidPayload(format!("payload encoding: {}", e)))?;
        let payload: Self = serde_json::from_slice(&json)
            .map_err(|e| PairingError::InvalidPayload(format!("payload body: {}", e)))?;

        if payload.version != PAYLOAD_VERSION {
            return Err(PairingError::InvalidPayload(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        payload.desktop_public_key_bytes()?;
        payload.ticket_bytes()?;
        Ok(payload)
    }

    pub fn ticket_bytes(&self) -> Result<Vec<u8>, PairingError> {
        decode_b64url(&self.ticket)
            .map_err(|_| PairingError::InvalidPayload("ticket is not base64url".to_string()))
    }

    pub fn desktop_public_key_bytes(&self) -> Result<[u8; 32], PairingError> {
        let bytes = decode_b64url(&self.desktop_public_key).map_err(|_| {
            PairingError::InvalidPayload("desktop public key is not base64url".to_string())
        })?;
        bytes
            .try_into()
            .map_err(|_| PairingError::InvalidPayload("desktop public key must be 32 bytes".to_string()))
    }

    /// Fingerprints the companion pins for this desktop.
    pub fn pinned_peer(&self) -> PinnedPeer {
        PinnedPeer::new(&self.ca_fingerprint, &self.leaf_fingerprint)
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BootstrapPayload {
        BootstrapPayload {
            version: PAYLOAD_VERSION,
            ticket: encode_b64url(&[1u8; 32]),
            desktop_public_key: encode_b64url(&[2u8; 32]),
            ca_fingerprint: "aa".repeat(32),
            leaf_fingerprint: "bb".repeat(32),
            bootstrap_url: "http://192.168.1.20:7420".to_string(),
            service_url: "https://192.168.1.20:7421".to_string(),
            profile_scope: "personal".to_string(),
            expires_at: 30,
        }
    }

    #[test]
    fn uri_roundtrip() {
        let uri = sample().to_uri().unwrap();
        assert!(uri.starts_with("pairsync://pair?d="));
        assert_eq!(BootstrapPayload::from_uri(&uri).unwrap(), sample());
    }

    #[test]
    fn rejects_foreign_uri() {
        assert!(matches!(
            BootstrapPayload::from_uri("https://example.com"),
            Err(PairingError::InvalidPayload(_))
        ));
        assert!(BootstrapPayload::from_uri("pairsync://pair?d=!!!").is_err());
    }

    #[test]
    fn rejects_bad_key_length() {
        let mut payload = sample();
        payload.desktop_public_key = encode_b64url(&[2u8; 16]);
        let uri = payload.to_uri().unwrap();
        assert!(BootstrapPayload::from_uri(&uri).is_err());
    }

    #[test]
    fn rejects_unknown_version() {
        let mut payload = sample();
        payload.version = 9;
        assert!(BootstrapPayload::from_uri(&payload.to_uri().unwrap()).is_err());
    }

    #[test]
    fn debug_hides_ticket() {
        let rendered = format!("{:?}", sample());
        assert!(!rendered.contains(&sample().ticket));
    }

    #[test]
    fn expiry_boundary() {
        let payload = sample();
        assert!(!payload.is_expired(29));
        assert!(payload.is_expired(30));
    }
}
