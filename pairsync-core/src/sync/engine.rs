//! Desktop-side sync orchestration.
//!
//! Writes go through [`DeltaSyncEngine::commit`] so every committed version is
//! also pushed to open channels. Reads are scoped to the profile bound to the
//! authenticated device; a device never names the profile it reads.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use super::companion::DeltaSource;
use super::hub::PushHub;
use super::models::{DeltaBatch, SyncMessage, VersionedEntity};
use super::store::ProfileStore;
use super::SyncError;
use crate::audit::{AuditEventType, AuditLogger};
use crate::config::SyncPolicy;
use crate::device::DeviceRegistry;
use crate::session::{Authenticated, RevocationObserver, SessionTokenManager};
use crate::{PairSyncError, Result};

/// Serves deltas and snapshots, and fans committed changes out to companions.
#[derive(Clone)]
pub struct DeltaSyncEngine {
    store: ProfileStore,
    hub: Arc<PushHub>,
    devices: DeviceRegistry,
    policy: SyncPolicy,
    audit: AuditLogger,
}

impl DeltaSyncEngine {
    pub fn new(store: ProfileStore, devices: DeviceRegistry, policy: SyncPolicy) -> Self {
        Self {
            hub: Arc::new(PushHub::new(policy.push_buffer)),
            store,
            devices,
            policy,
            audit: AuditLogger::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn hub(&self) -> &PushHub {
        &self.hub
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Commit an entity and push it to every open channel on the profile.
    pub fn commit(&self, profile_scope: &str, entity_id: &str, payload: &[u8]) -> Result<VersionedEntity> {
        let entity = self.store.commit(profile_scope, entity_id, payload)?;
        self.push(&entity);
        Ok(entity)
    }

    /// Tombstone an entity and push the tombstone.
    pub fn delete(&self, profile_scope: &str, entity_id: &str) -> Result<Option<VersionedEntity>> {
        let tombstone = self.store.delete(profile_scope, entity_id)?;
        if let Some(ref entity) = tombstone {
            self.push(entity);
        }
        Ok(tombstone)
    }

    fn push(&self, entity: &VersionedEntity) {
        let delivered = self
            .hub
            .publish(&entity.profile_scope, &SyncMessage::Change(DeltaBatch::single(entity.clone())));
        if delivered > 0 {
            tracing::debug!(
                "Pushed version {} of {} to {} devices",
                entity.version,
                entity.profile_scope,
                delivered
            );
        }
    }

    /// Changes after `since_version` in the caller's profile.
    pub fn pull(
        &self,
        identity: &Authenticated,
        since_version: u64,
        max_batch_size: Option<usize>,
    ) -> Result<DeltaBatch> {
        let batch_size = self.policy.batch_size(max_batch_size);
        match self
            .store
            .compute_delta(&identity.profile_scope, since_version, batch_size)
        {
            Err(PairSyncError::Sync(SyncError::VersionGap {
                profile_scope,
                since_version,
                retained_floor,
            })) => {
                warn!(
                    "Device {} cursor {} is behind retained floor {} of {}",
                    identity.device_id, since_version, retained_floor, profile_scope
                );
                self.audit.record(
                    AuditEventType::VersionGapDetected {
                        profile_scope: profile_scope.clone(),
                        since_version,
                    },
                    &identity.device_id.to_string(),
                );
                Err(SyncError::VersionGap {
                    profile_scope,
                    since_version,
                    retained_floor,
                }
                .into())
            }
            other => other,
        }
    }

    /// One page of a full snapshot of the caller's profile.
    pub fn snapshot_page(
        &self,
        identity: &Authenticated,
        after_version: u64,
        max_batch_size: Option<usize>,
    ) -> Result<DeltaBatch> {
        let batch_size = self.policy.batch_size(max_batch_size);
        self.store
            .snapshot_page(&identity.profile_scope, after_version, batch_size)
    }

    /// Open the push channel for a device. The first message is a heartbeat
    /// carrying the current head so the companion can tell whether to pull.
    pub fn open_channel(&self, identity: &Authenticated) -> Result<mpsc::Receiver<SyncMessage>> {
        let rx = self
            .hub
            .subscribe(identity.device_id, &identity.profile_scope);
        let heartbeat = self.heartbeat(identity)?;
        self.hub.send_to(&identity.device_id, heartbeat);
        info!("Opened push channel for device {}", identity.device_id);
        Ok(rx)
    }

    /// Heartbeat for the caller's profile.
    pub fn heartbeat(&self, identity: &Authenticated) -> Result<SyncMessage> {
        Ok(SyncMessage::Heartbeat {
            head_version: self.store.head_version(&identity.profile_scope)?,
        })
    }

    /// Close a device's push channel.
    pub fn close_channel(&self, device_id: &Uuid) {
        self.hub.disconnect(device_id, None);
    }

    /// Prune tombstones past the configured retention.
    pub fn prune_tombstones(&self) -> Result<usize> {
        self.store
            .prune_tombstones(self.policy.tombstone_retention_secs)
    }
}

impl RevocationObserver for DeltaSyncEngine {
    /// A wipe that cannot be queued stays pending and is handed out with the
    /// device's next rejected request.
    fn on_revoked(&self, device_id: &Uuid) {
        if self.hub.disconnect(device_id, Some(SyncMessage::Wipe)) {
            info!("Sent wipe to revoked device {}", device_id);
            if let Err(e) = self.devices.acknowledge_wipe(device_id) {
                warn!("Failed to clear wipe flag for {}: {}", device_id, e);
            }
        }
    }
}

/// A [`DeltaSource`] that talks to an engine in the same process.
///
/// The bearer is re-authenticated on every call, exactly as the HTTP
/// handlers do.
#[derive(Clone)]
pub struct InProcessSource {
    engine: DeltaSyncEngine,
    sessions: SessionTokenManager,
    bearer: String,
}

impl InProcessSource {
    pub fn new(engine: DeltaSyncEngine, sessions: SessionTokenManager, bearer: impl Into<String>) -> Self {
        Self {
            engine,
            sessions,
            bearer: bearer.into(),
        }
    }

    /// Swap in a rotated bearer.
    pub fn set_bearer(&mut self, bearer: impl Into<String>) {
        self.bearer = bearer.into();
    }

    /// Authenticate and open the push channel.
    pub fn open_channel(&self) -> Result<mpsc::Receiver<SyncMessage>> {
        let identity = self.sessions.authenticate(&self.bearer)?;
        self.engine.open_channel(&identity)
    }
}

impl DeltaSource for InProcessSource {
    async fn pull(&self, since_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch> {
        let identity = self.sessions.authenticate(&self.bearer)?;
        self.engine.pull(&identity, since_version, max_batch_size)
    }

    async fn snapshot_page(&self, after_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch> {
        let identity = self.sessions.authenticate(&self.bearer)?;
        self.engine
            .snapshot_page(&identity, after_version, max_batch_size)
    }
}
