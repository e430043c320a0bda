//! Local certificate authority.
//!
//! One ECDSA P-256 root is generated on first run and persisted under
//! `<data_dir>/ca/`. Every later start reuses it. Leaf certificates are
//! short-lived, bound to one local IP address, and tracked in a registry for
//! as long as their [`LeafLease`] is held.

pub mod pinning;

pub use pinning::PinnedPeer;

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEventType, AuditLogger};
use crate::clock::SharedClock;
use crate::config::CaPolicy;
use crate::crypto::{fingerprint, random_bytes};
use crate::platform::restrict_permissions;

const ROOT_KEY_FILE: &str = "root.key.pem";
const ROOT_CERT_FILE: &str = "root.cert.der";
const ROOT_META_FILE: &str = "root.json";

/// Root is backdated so companions whose clocks run slightly behind still
/// accept it.
const ROOT_BACKDATE_SECS: i64 = 3600;
/// Leaves are backdated by a smaller margin for the same reason.
const LEAF_BACKDATE_SECS: i64 = 300;

/// Certificate authority failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("Certificate issuance failed: {0}")]
    IssuanceFailed(String),

    #[error("Certificate fingerprint mismatch: expected {expected}, presented {presented}")]
    FingerprintMismatch { expected: String, presented: String },

    #[error("Certificate expired")]
    CertificateExpired,

    #[error("CA storage error: {0}")]
    Storage(String),
}

type CaResult<T> = std::result::Result<T, CertificateError>;

/// Persisted description of the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootMetadata {
    pub common_name: String,
    /// Hex-encoded serial number.
    pub serial: String,
    pub not_before: i64,
    pub not_after: i64,
    /// Lowercase hex SHA-256 of `root.cert.der`.
    pub fingerprint: String,
    pub created_at: i64,
}

/// A signed leaf certificate and its private key.
pub struct IssuedLeaf {
    pub der: Vec<u8>,
    pub pem: String,
    pub private_key_pem: Zeroizing<String>,
    /// PKCS#8 DER form of the same key.
    pub private_key_der: Zeroizing<Vec<u8>>,
    pub fingerprint: String,
    pub serial: String,
    pub address: IpAddr,
    pub not_before: i64,
    pub not_after: i64,
}

impl std::fmt::Debug for IssuedLeaf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedLeaf")
            .field("fingerprint", &self.fingerprint)
            .field("address", &self.address)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct LeafRecord {
    not_after: i64,
}

type LeafRegistry = Arc<Mutex<HashMap<String, LeafRecord>>>;

/// Scope guard for an issued leaf.
///
/// The leaf is trusted by [`CaManager::is_leaf_trusted`] only while the lease
/// is alive and unexpired. Dropping it, on success or error paths alike,
/// removes the leaf from the registry.
#[derive(Debug)]
pub struct LeafLease {
    leaf: IssuedLeaf,
    registry: Weak<Mutex<HashMap<String, LeafRecord>>>,
}

impl LeafLease {
    pub fn certificate(&self) -> &IssuedLeaf {
        &self.leaf
    }

    pub fn fingerprint(&self) -> &str {
        &self.leaf.fingerprint
    }

    pub fn not_after(&self) -> i64 {
        self.leaf.not_after
    }

    /// End the lease now.
    pub fn release(self) {}
}

impl Drop for LeafLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut leaves) = registry.lock() {
                leaves.remove(&self.leaf.fingerprint);
            }
        }
    }
}

/// Owner of the root key and issuer of leaves.
pub struct CaManager {
    dir: PathBuf,
    policy: CaPolicy,
    clock: SharedClock,
    root_der: Vec<u8>,
    metadata: RootMetadata,
    signer: Certificate,
    leaves: LeafRegistry,
    created: bool,
    audit: AuditLogger,
}

impl std::fmt::Debug for CaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaManager")
            .field("dir", &self.dir)
            .field("fingerprint", &self.metadata.fingerprint)
            .finish()
    }
}

impl CaManager {
    /// Load the root from `dir`, generating and persisting it on first run.
    ///
    /// A partially present or unreadable root is a [`CertificateError::Storage`]
    /// error; callers treat it as fatal.
    pub fn load_or_create(dir: &Path, policy: CaPolicy, clock: SharedClock) -> CaResult<Self> {
        let key_path = dir.join(ROOT_KEY_FILE);
        let cert_path = dir.join(ROOT_CERT_FILE);
        let meta_path = dir.join(ROOT_META_FILE);

        let present = [&key_path, &cert_path, &meta_path]
            .iter()
            .filter(|p| p.exists())
            .count();

        match present {
            0 => Self::create(dir, policy, clock),
            3 => Self::load(dir, policy, clock),
            _ => Err(CertificateError::Storage(format!(
                "Incomplete CA material in {:?}; remove the directory to regenerate",
                dir
            ))),
        }
    }

    fn create(dir: &Path, policy: CaPolicy, clock: SharedClock) -> CaResult<Self> {
        fs::create_dir_all(dir).map_err(|e| storage("create CA directory", e))?;

        let now = clock.now();
        let mut serial: [u8; 16] = random_bytes();
        serial[0] &= 0x7f;

        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CertificateError::IssuanceFailed(format!("root key generation: {}", e)))?;
        let key_pem = Zeroizing::new(key_pair.serialize_pem());

        let mut metadata = RootMetadata {
            common_name: policy.common_name.clone(),
            serial: hex::encode(serial),
            not_before: now - ROOT_BACKDATE_SECS,
            not_after: now + policy.root_validity_days * 86_400,
            fingerprint: String::new(),
            created_at: now,
        };

        let signer = build_root(&metadata, key_pair)?;
        let root_der = signer
            .serialize_der()
            .map_err(|e| CertificateError::IssuanceFailed(format!("root self-signing: {}", e)))?;
        metadata.fingerprint = fingerprint(&root_der);

        let key_path = dir.join(ROOT_KEY_FILE);
        fs::write(&key_path, key_pem.as_bytes()).map_err(|e| storage("write root key", e))?;
        restrict_permissions(&key_path).map_err(|e| storage("restrict root key", e))?;
        fs::write(dir.join(ROOT_CERT_FILE), &root_der).map_err(|e| storage("write root cert", e))?;
        let meta_json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| CertificateError::Storage(format!("encode root metadata: {}", e)))?;
        fs::write(dir.join(ROOT_META_FILE), meta_json).map_err(|e| storage("write root metadata", e))?;

        info!(
            "Created local CA root {} (valid until {})",
            metadata.fingerprint, metadata.not_after
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            clock,
            root_der,
            metadata,
            signer,
            leaves: Arc::new(Mutex::new(HashMap::new())),
            created: true,
            audit: AuditLogger::disabled(),
        })
    }

    fn load(dir: &Path, policy: CaPolicy, clock: SharedClock) -> CaResult<Self> {
        let key_pem = Zeroizing::new(
            fs::read_to_string(dir.join(ROOT_KEY_FILE)).map_err(|e| storage("read root key", e))?,
        );
        let root_der = fs::read(dir.join(ROOT_CERT_FILE)).map_err(|e| storage("read root cert", e))?;
        let meta_json =
            fs::read(dir.join(ROOT_META_FILE)).map_err(|e| storage("read root metadata", e))?;
        let metadata: RootMetadata = serde_json::from_slice(&meta_json)
            .map_err(|e| CertificateError::Storage(format!("decode root metadata: {}", e)))?;

        if fingerprint(&root_der) != metadata.fingerprint {
            return Err(CertificateError::Storage(
                "root certificate does not match its metadata".to_string(),
            ));
        }

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CertificateError::Storage(format!("parse root key: {}", e)))?;
        // Only the issuer name and key of the signer matter when signing
        // leaves; the persisted DER stays the published root.
        let signer = build_root(&metadata, key_pair)?;

        info!("Loaded local CA root {}", metadata.fingerprint);

        Ok(Self {
            dir: dir.to_path_buf(),
            policy,
            clock,
            root_der,
            metadata,
            signer,
            leaves: Arc::new(Mutex::new(HashMap::new())),
            created: false,
            audit: AuditLogger::disabled(),
        })
    }

    /// Attach an audit logger for leaf events. A root generated by this
    /// `load_or_create` is recorded right away.
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        if self.created {
            audit.record(
                AuditEventType::CaCreated {
                    fingerprint: self.metadata.fingerprint.clone(),
                },
                &self.dir.display().to_string(),
            );
        }
        self.audit = audit;
        self
    }

    /// True if this call to `load_or_create` generated the root.
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> &RootMetadata {
        &self.metadata
    }

    /// Root certificate (DER). Public data only.
    pub fn get_root_certificate(&self) -> Vec<u8> {
        self.root_der.clone()
    }

    /// Root certificate in PEM form.
    pub fn root_certificate_pem(&self) -> String {
        der_to_pem("CERTIFICATE", &self.root_der)
    }

    /// Stable SHA-256 fingerprint of the root, used for pinning.
    pub fn root_fingerprint(&self) -> &str {
        &self.metadata.fingerprint
    }

    /// Issue a leaf for `address` valid for up to `lifetime_secs`.
    ///
    /// The lifetime is clamped to the policy maximum and to the root's own
    /// expiry. A failed attempt is retried once with a fresh clock read.
    pub fn issue_leaf(&self, address: IpAddr, lifetime_secs: i64) -> CaResult<LeafLease> {
        let leaf = match self.try_issue(address, lifetime_secs) {
            Ok(leaf) => leaf,
            Err(CertificateError::CertificateExpired) => {
                return Err(CertificateError::CertificateExpired)
            }
            Err(first) => {
                warn!("Leaf issuance failed ({}); retrying with a fresh clock read", first);
                self.try_issue(address, lifetime_secs)?
            }
        };

        self.leaves
            .lock()
            .map_err(|_| CertificateError::IssuanceFailed("leaf registry poisoned".to_string()))?
            .insert(
                leaf.fingerprint.clone(),
                LeafRecord {
                    not_after: leaf.not_after,
                },
            );

        info!(
            "Issued leaf {} for {} (expires {})",
            leaf.fingerprint, leaf.address, leaf.not_after
        );
        self.audit.record(
            AuditEventType::LeafIssued {
                fingerprint: leaf.fingerprint.clone(),
                address: leaf.address.to_string(),
                not_after: leaf.not_after,
            },
            "",
        );

        Ok(LeafLease {
            leaf,
            registry: Arc::downgrade(&self.leaves),
        })
    }

    fn try_issue(&self, address: IpAddr, lifetime_secs: i64) -> CaResult<IssuedLeaf> {
        let now = self.clock.now();
        if now >= self.metadata.not_after {
            return Err(CertificateError::CertificateExpired);
        }
        if now < self.metadata.not_before {
            return Err(CertificateError::IssuanceFailed(format!(
                "clock reads {} which precedes the CA validity start {}",
                now, self.metadata.not_before
            )));
        }

        let lifetime = lifetime_secs.clamp(1, self.policy.max_leaf_lifetime_secs);
        let not_before = (now - LEAF_BACKDATE_SECS).max(self.metadata.not_before);
        let not_after = (now + lifetime).min(self.metadata.not_after);

        let mut serial: [u8; 16] = random_bytes();
        serial[0] &= 0x7f;

        let mut params = CertificateParams::new(Vec::<String>::new());
        params.alg = &PKCS_ECDSA_P256_SHA256;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("pairsync {}", address));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::IpAddress(address)];
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = to_offset(not_before)?;
        params.not_after = to_offset(not_after)?;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let cert = Certificate::from_params(params)
            .map_err(|e| CertificateError::IssuanceFailed(format!("leaf params: {}", e)))?;
        let der = cert
            .serialize_der_with_signer(&self.signer)
            .map_err(|e| CertificateError::IssuanceFailed(format!("leaf signing: {}", e)))?;

        Ok(IssuedLeaf {
            pem: der_to_pem("CERTIFICATE", &der),
            private_key_pem: Zeroizing::new(cert.serialize_private_key_pem()),
            private_key_der: Zeroizing::new(cert.serialize_private_key_der()),
            fingerprint: fingerprint(&der),
            serial: hex::encode(serial),
            der,
            address,
            not_before,
            not_after,
        })
    }

    /// Whether a leaf is live: leased, not revoked and not expired.
    pub fn is_leaf_trusted(&self, leaf_fingerprint: &str) -> bool {
        let now = self.clock.now();
        let key = leaf_fingerprint.to_ascii_lowercase();
        self.leaves
            .lock()
            .map(|leaves| leaves.get(&key).is_some_and(|r| now < r.not_after))
            .unwrap_or(false)
    }

    /// Withdraw trust from a leaf before its lease ends.
    pub fn revoke_leaf(&self, leaf_fingerprint: &str) -> bool {
        let key = leaf_fingerprint.to_ascii_lowercase();
        let removed = self
            .leaves
            .lock()
            .map(|mut leaves| leaves.remove(&key).is_some())
            .unwrap_or(false);
        if removed {
            info!("Revoked leaf {}", key);
            self.audit
                .record(AuditEventType::LeafRevoked { fingerprint: key }, "");
        }
        removed
    }

    /// Drop expired leaves from the registry. Returns how many were removed.
    pub fn prune_expired_leaves(&self) -> usize {
        let now = self.clock.now();
        self.leaves
            .lock()
            .map(|mut leaves| {
                let before = leaves.len();
                leaves.retain(|_, r| now < r.not_after);
                before - leaves.len()
            })
            .unwrap_or(0)
    }

    /// Number of leaves currently trusted or awaiting pruning.
    pub fn live_leaf_count(&self) -> usize {
        self.leaves.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether a lease is close enough to expiry that it should be replaced.
    pub fn needs_renewal(&self, lease: &LeafLease) -> bool {
        self.clock.now() >= lease.not_after() - self.policy.leaf_renew_before_secs
    }

    pub fn policy(&self) -> &CaPolicy {
        &self.policy
    }
}

fn build_root(metadata: &RootMetadata, key_pair: KeyPair) -> CaResult<Certificate> {
    let serial = hex::decode(&metadata.serial)
        .map_err(|e| CertificateError::Storage(format!("decode root serial: {}", e)))?;

    let mut params = CertificateParams::new(Vec::<String>::new());
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, metadata.common_name.clone());
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = to_offset(metadata.not_before)?;
    params.not_after = to_offset(metadata.not_after)?;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.key_pair = Some(key_pair);

    Certificate::from_params(params)
        .map_err(|e| CertificateError::IssuanceFailed(format!("root params: {}", e)))
}

fn to_offset(ts: i64) -> CaResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| CertificateError::IssuanceFailed(format!("timestamp {} out of range: {}", ts, e)))
}

fn storage(action: &str, e: std::io::Error) -> CertificateError {
    CertificateError::Storage(format!("{}: {}", action, e))
}

/// Wrap DER bytes in a PEM block.
pub fn der_to_pem(label: &str, der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for chunk in encoded.as_bytes().chunks(64) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::net::Ipv4Addr;

    const LAN: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));

    fn manager(dir: &Path, clock: &ManualClock) -> CaManager {
        CaManager::load_or_create(dir, CaPolicy::default(), clock.shared()).unwrap()
    }

    #[test]
    fn root_is_created_once_and_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();

        let first = manager(tmp.path(), &clock);
        assert!(first.was_created());
        let fp = first.root_fingerprint().to_string();
        let der = first.get_root_certificate();

        let second = manager(tmp.path(), &clock);
        assert!(!second.was_created());
        assert_eq!(second.root_fingerprint(), fp);
        assert_eq!(second.get_root_certificate(), der);
        assert_eq!(fingerprint(&der), fp);
    }

    #[test]
    fn root_pem_wraps_der() {
        let tmp = tempfile::tempdir().unwrap();
        let ca = manager(tmp.path(), &ManualClock::default());
        let pem = ca.root_certificate_pem();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
        assert!(pem.lines().all(|l| l.len() <= 64));
    }

    #[test]
    fn incomplete_material_is_a_storage_error() {
        let tmp = tempfile::tempdir().unwrap();
        manager(tmp.path(), &ManualClock::default());
        fs::remove_file(tmp.path().join(ROOT_CERT_FILE)).unwrap();

        let err = CaManager::load_or_create(
            tmp.path(),
            CaPolicy::default(),
            ManualClock::default().shared(),
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::Storage(_)));
    }

    #[test]
    fn tampered_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        manager(tmp.path(), &ManualClock::default());
        let mut der = fs::read(tmp.path().join(ROOT_CERT_FILE)).unwrap();
        let last = der.len() - 1;
        der[last] ^= 0x01;
        fs::write(tmp.path().join(ROOT_CERT_FILE), der).unwrap();

        let err = CaManager::load_or_create(
            tmp.path(),
            CaPolicy::default(),
            ManualClock::default().shared(),
        )
        .unwrap_err();
        assert!(matches!(err, CertificateError::Storage(_)));
    }

    #[test]
    fn leaf_is_bound_and_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        let lease = ca.issue_leaf(LAN, 3600).unwrap();
        let leaf = lease.certificate();
        assert_eq!(leaf.address, LAN);
        assert_eq!(leaf.not_after, clock.now() + 3600);
        assert_eq!(leaf.fingerprint, fingerprint(&leaf.der));
        assert_ne!(leaf.fingerprint, ca.root_fingerprint());
        assert!(leaf.private_key_pem.contains("PRIVATE KEY"));

        let long = ca.issue_leaf(LAN, 365 * 86_400).unwrap();
        assert_eq!(
            long.not_after(),
            clock.now() + CaPolicy::default().max_leaf_lifetime_secs
        );
    }

    #[test]
    fn leaf_never_outlives_root() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        clock.set(ca.metadata().not_after - 60);
        let lease = ca.issue_leaf(LAN, 86_400).unwrap();
        assert_eq!(lease.not_after(), ca.metadata().not_after);
    }

    #[test]
    fn expired_root_refuses_issuance() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        clock.set(ca.metadata().not_after);
        assert_eq!(
            ca.issue_leaf(LAN, 60).unwrap_err(),
            CertificateError::CertificateExpired
        );
    }

    #[test]
    fn skewed_clock_fails_after_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        clock.set(ca.metadata().not_before - 10);
        assert!(matches!(
            ca.issue_leaf(LAN, 60),
            Err(CertificateError::IssuanceFailed(_))
        ));
        assert_eq!(ca.live_leaf_count(), 0);
    }

    #[test]
    fn lease_controls_trust() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        let lease = ca.issue_leaf(LAN, 600).unwrap();
        let fp = lease.fingerprint().to_string();
        assert!(ca.is_leaf_trusted(&fp));
        assert!(ca.is_leaf_trusted(&fp.to_uppercase()));

        drop(lease);
        assert!(!ca.is_leaf_trusted(&fp));
        assert_eq!(ca.live_leaf_count(), 0);
    }

    #[test]
    fn revoked_and_expired_leaves_are_untrusted() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        let revoked = ca.issue_leaf(LAN, 600).unwrap();
        assert!(ca.revoke_leaf(revoked.fingerprint()));
        assert!(!ca.is_leaf_trusted(revoked.fingerprint()));
        assert!(!ca.revoke_leaf(revoked.fingerprint()));

        let expiring = ca.issue_leaf(LAN, 60).unwrap();
        clock.advance(61);
        assert!(!ca.is_leaf_trusted(expiring.fingerprint()));
        assert_eq!(ca.prune_expired_leaves(), 1);
        assert_eq!(ca.live_leaf_count(), 0);
    }

    #[test]
    fn renewal_window() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let ca = manager(tmp.path(), &clock);

        let lease = ca.issue_leaf(LAN, 7200).unwrap();
        assert!(!ca.needs_renewal(&lease));
        clock.advance(7200 - CaPolicy::default().leaf_renew_before_secs);
        assert!(ca.needs_renewal(&lease));
    }
}
