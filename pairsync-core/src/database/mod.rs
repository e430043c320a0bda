//! SQLite persistence shared by every component.
//!
//! One [`Database`] handle wraps a single connection behind a mutex and is
//! cloned into each manager. Multi-row state transitions run inside one
//! transaction on that connection, so they are all-or-nothing and readers
//! never observe a half-applied change.

pub mod schema;

pub use schema::{Database, CURRENT_SCHEMA_VERSION};

use thiserror::Error;

/// Storage-level failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("File I/O error: {0}")]
    FileIo(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },
}
