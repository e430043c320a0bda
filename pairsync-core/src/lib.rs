//! PairSync Core Library
//!
//! This library provides secure pairing between a desktop (the single writer
//! and source of truth) and companion devices on the same local network, and
//! keeps each companion's cached view consistent with the desktop through
//! versioned delta synchronization. It includes the local certificate
//! authority, pairing tickets, session credentials, the desktop profile store,
//! and the companion-side cache and sync driver.

pub mod audit;
pub mod ca;
#[cfg(feature = "client")]
pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod database;
pub mod device;
pub mod pairing;
pub mod platform;
pub mod session;
pub mod sync;

pub use ca::{CaManager, CertificateError, LeafLease, PinnedPeer};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CaPolicy, CoreConfig, PairingPolicy, RetryPolicy, SessionPolicy, SyncPolicy};
pub use crypto::CryptoError;
pub use database::{Database, DatabaseError};
pub use device::{Device, DeviceRegistry, DeviceRole, PairingState};
pub use pairing::{BootstrapPayload, PairingCoordinator, PairingError, TrustAnchor};
pub use platform::{ensure_data_dir, get_data_dir};
pub use session::{Authenticated, SessionTokenManager, TokenError, TokenState};
pub use sync::{
    CompanionCache, CompanionSync, DeltaBatch, DeltaSyncEngine, ProfileStore, SyncError,
    SyncMessage, VersionedEntity,
};

use thiserror::Error;

/// Result type for pairsync operations
pub type Result<T> = std::result::Result<T, PairSyncError>;

/// General error type for pairsync operations
#[derive(Error, Debug)]
pub enum PairSyncError {
    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for PairSyncError {
    fn from(e: rusqlite::Error) -> Self {
        PairSyncError::Database(DatabaseError::Sqlite(e))
    }
}

impl PairSyncError {
    /// The token error carried by this error, if any.
    pub fn as_token_error(&self) -> Option<&TokenError> {
        match self {
            PairSyncError::Token(e) => Some(e),
            _ => None,
        }
    }

    /// The sync error carried by this error, if any.
    pub fn as_sync_error(&self) -> Option<&SyncError> {
        match self {
            PairSyncError::Sync(e) => Some(e),
            _ => None,
        }
    }
}
