//! Shared daemon state: every core component, wired to one database.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use pairsync_core::audit::AuditLogger;
use pairsync_core::ca::LeafLease;
use pairsync_core::platform::{ca_dir, desktop_db_path, restrict_permissions};
use pairsync_core::{
    CaManager, Database, DeltaSyncEngine, DeviceRegistry, PairingCoordinator, ProfileStore,
    SessionTokenManager, SharedClock, TrustAnchor,
};

use crate::config::DesktopConfig;
use crate::rate_limit::RateLimiter;
use crate::tls::LeafResolver;

pub const SERVING_LEAF_FILE: &str = "serving-leaf.pem";
pub const SERVING_KEY_FILE: &str = "serving-leaf.key.pem";
pub const TRUST_ANCHOR_FILE: &str = "trust-anchor.json";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<DesktopConfig>,
    pub data_dir: PathBuf,
    pub clock: SharedClock,
    pub ca: Arc<CaManager>,
    serving_leaf: Arc<RwLock<LeafLease>>,
    /// Certificate source for the TLS service endpoint.
    pub tls: Arc<LeafResolver>,
    pub pairing: PairingCoordinator,
    pub sessions: SessionTokenManager,
    pub engine: DeltaSyncEngine,
    pub devices: DeviceRegistry,
    pub audit: AuditLogger,
    pub redeem_limiter: RateLimiter,
}

impl AppState {
    /// Open the store and the CA, issue the serving leaf and wire the
    /// components together. Any failure here is fatal to startup.
    pub fn initialize(config: DesktopConfig, clock: SharedClock) -> anyhow::Result<Self> {
        let data_dir = config.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("create data dir {}", data_dir.display()))?;

        let db = Database::open(desktop_db_path(&data_dir))?;
        db.initialize_desktop_schema()?;
        let audit = AuditLogger::new(&data_dir)?;
        Self::assemble(config, data_dir, db, audit, clock)
    }

    /// Wire components over an already open database.
    pub fn assemble(
        config: DesktopConfig,
        data_dir: PathBuf,
        db: Database,
        audit: AuditLogger,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let core = config.core.clone();

        let ca = CaManager::load_or_create(&ca_dir(&data_dir), core.ca.clone(), clock.clone())
            .context("load certificate authority")?
            .with_audit(audit.clone());
        let lease = ca
            .issue_leaf(config.advertised_ip, core.ca.default_leaf_lifetime_secs)
            .context("issue serving leaf")?;
        let tls = Arc::new(LeafResolver::new(
            lease.certificate(),
            &ca.get_root_certificate(),
        )?);

        let sessions = SessionTokenManager::new(db.clone(), core.session.clone(), clock.clone())?
            .with_audit(audit.clone());
        let devices = DeviceRegistry::new(db.clone());
        let engine = DeltaSyncEngine::new(
            ProfileStore::new(db.clone(), clock.clone()),
            devices.clone(),
            core.sync.clone(),
        )
        .with_audit(audit.clone());
        sessions.add_observer(Arc::new(engine.clone()));

        let pairing =
            PairingCoordinator::new(db, core.pairing.clone(), sessions.clone(), clock.clone())
                .with_audit(audit.clone());

        let state = Self {
            redeem_limiter: RateLimiter::new(config.redeem_rate_limit_per_minute),
            config: Arc::new(config),
            data_dir,
            clock,
            ca: Arc::new(ca),
            serving_leaf: Arc::new(RwLock::new(lease)),
            tls,
            pairing,
            sessions,
            engine,
            devices,
            audit,
        };
        state.write_serving_files()?;
        Ok(state)
    }

    /// Fingerprints and endpoints that go into every pairing payload.
    pub fn trust_anchor(&self) -> TrustAnchor {
        TrustAnchor {
            ca_fingerprint: self.ca.root_fingerprint().to_string(),
            leaf_fingerprint: self.serving_leaf_fingerprint(),
            bootstrap_url: self.config.bootstrap_url(),
            service_url: self.config.service_url(),
        }
    }

    pub fn serving_leaf_fingerprint(&self) -> String {
        self.serving_leaf
            .read()
            .map(|lease| lease.fingerprint().to_string())
            .unwrap_or_default()
    }

    /// Replace the serving leaf when it is close to expiry.
    /// Returns whether a new leaf was issued.
    pub fn renew_serving_leaf_if_due(&self) -> anyhow::Result<bool> {
        let due = self
            .serving_leaf
            .read()
            .map(|lease| self.ca.needs_renewal(&lease))
            .unwrap_or(true);
        if !due {
            return Ok(false);
        }

        let lease = self.ca.issue_leaf(
            self.config.advertised_ip,
            self.ca.policy().default_leaf_lifetime_secs,
        )?;
        self.tls
            .update(lease.certificate(), &self.ca.get_root_certificate())?;
        {
            let mut current = self
                .serving_leaf
                .write()
                .map_err(|_| anyhow::anyhow!("serving leaf lock poisoned"))?;
            // The old lease drops here and stops being trusted.
            *current = lease;
        }
        self.write_serving_files()?;
        tracing::info!("Renewed serving leaf: {}", self.serving_leaf_fingerprint());
        Ok(true)
    }

    /// Write the serving chain, its key and the trust anchor for operator
    /// tooling.
    fn write_serving_files(&self) -> anyhow::Result<()> {
        let lease = self
            .serving_leaf
            .read()
            .map_err(|_| anyhow::anyhow!("serving leaf lock poisoned"))?;
        let leaf = lease.certificate();

        let chain = format!("{}{}", leaf.pem, self.ca.root_certificate_pem());
        std::fs::write(self.data_dir.join(SERVING_LEAF_FILE), chain)?;

        let key_path = self.data_dir.join(SERVING_KEY_FILE);
        std::fs::write(&key_path, leaf.private_key_pem.as_bytes())?;
        restrict_permissions(&key_path)?;
        drop(lease);

        write_trust_anchor(&self.data_dir, &self.trust_anchor())?;
        Ok(())
    }
}

fn write_trust_anchor(dir: &Path, anchor: &TrustAnchor) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(anchor)?;
    std::fs::write(dir.join(TRUST_ANCHOR_FILE), json)?;
    Ok(())
}
