//! Delta synchronization.
//!
//! The desktop is the single writer. Every commit bumps the profile's head
//! version and stores the entity at that version in one transaction.
//! Companions hold a cursor per profile and ask for everything past it,
//! either by pulling ([`DeltaSyncEngine::pull`]) or by receiving pushed
//! changes on an open channel. Both paths end in
//! [`CompanionCache::apply_delta`].
//!
//! - [`store`]: desktop profile store (versions, tombstones, delta queries)
//! - [`hub`]: per-device push channels
//! - [`engine`]: desktop-side orchestration and revocation handling
//! - [`cache`]: companion cache with the idempotent apply path
//! - [`companion`]: companion driver (catch-up, resync, push loop)

pub mod cache;
pub mod companion;
pub mod engine;
pub mod hub;
pub mod models;
pub mod store;

pub use cache::{ApplyOutcome, CompanionCache, CompanionCredentials};
pub use companion::{CompanionSync, DeltaSource, DuplexChannel, PushExit};
pub use engine::{DeltaSyncEngine, InProcessSource};
pub use hub::PushHub;
pub use models::{DeltaBatch, PullRequest, SnapshotRequest, SyncMessage, VersionedEntity};
pub use store::ProfileStore;

use thiserror::Error;

/// Synchronization failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The cursor predates retained history; a full snapshot is required.
    #[error("Version gap in profile {profile_scope}: cursor {since_version} is outside retained history (floor {retained_floor})")]
    VersionGap {
        profile_scope: String,
        since_version: u64,
        retained_floor: u64,
    },

    /// Network failure; retry from the last applied cursor.
    #[error("Transport interrupted: {0}")]
    TransportInterrupted(String),

    /// A batch could not be applied cleanly. Fatal to the sync session.
    #[error("Apply integrity violation: {0}")]
    ApplyIntegrityViolation(String),
}

impl SyncError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::VersionGap { .. } => "version_gap",
            SyncError::TransportInterrupted(_) => "transport_interrupted",
            SyncError::ApplyIntegrityViolation(_) => "apply_integrity_violation",
        }
    }
}
