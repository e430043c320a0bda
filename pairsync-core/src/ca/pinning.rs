//! Fingerprint pinning for the first connection to a desktop.

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::CertificateError;
use crate::crypto::{fingerprint, fingerprints_match};

/// Fingerprints received out of band in the pairing payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedPeer {
    pub ca_fingerprint: String,
    pub leaf_fingerprint: String,
}

impl PinnedPeer {
    pub fn new(ca_fingerprint: &str, leaf_fingerprint: &str) -> Self {
        Self {
            ca_fingerprint: ca_fingerprint.to_ascii_lowercase(),
            leaf_fingerprint: leaf_fingerprint.to_ascii_lowercase(),
        }
    }

    /// Check a root certificate fetched from the bootstrap endpoint.
    pub fn verify_root(&self, der: &[u8]) -> Result<(), CertificateError> {
        verify_fingerprint(&self.ca_fingerprint, der)
    }

    /// Check the leaf presented by the service endpoint.
    pub fn verify_leaf(&self, der: &[u8]) -> Result<(), CertificateError> {
        verify_fingerprint(&self.leaf_fingerprint, der)
    }
}

/// Compare the SHA-256 of `der` against `expected` in constant time.
pub fn verify_fingerprint(expected: &str, der: &[u8]) -> Result<(), CertificateError> {
    let presented = fingerprint(der);
    if fingerprints_match(expected, &presented) {
        Ok(())
    } else {
        warn!(
            "Certificate fingerprint mismatch: expected {}, presented {}",
            expected, presented
        );
        Err(CertificateError::FingerprintMismatch {
            expected: expected.to_ascii_lowercase(),
            presented,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_certificates_pass() {
        let root = b"root der";
        let leaf = b"leaf der";
        let pin = PinnedPeer::new(&fingerprint(root), &fingerprint(leaf).to_uppercase());

        assert!(pin.verify_root(root).is_ok());
        assert!(pin.verify_leaf(leaf).is_ok());
    }

    #[test]
    fn substituted_certificate_is_rejected() {
        let pin = PinnedPeer::new(&fingerprint(b"root"), &fingerprint(b"leaf"));

        match pin.verify_leaf(b"attacker leaf") {
            Err(CertificateError::FingerprintMismatch { expected, presented }) => {
                assert_eq!(expected, fingerprint(b"leaf"));
                assert_eq!(presented, fingerprint(b"attacker leaf"));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
        assert!(pin.verify_root(b"leaf").is_err());
    }
}
