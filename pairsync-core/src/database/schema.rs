//! Database schema and connection management.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension};

use super::DatabaseError;
use crate::crypto::random_bytes;
use crate::Result;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Thread-safe handle to the SQLite store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open a database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;
        // journal_mode returns the resulting mode as a row
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(DatabaseError::Sqlite)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Lock the connection.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DatabaseError::LockPoisoned(format!("database connection: {}", e)).into())
    }

    /// Create the tables owned by the desktop (authoritative) side and seed
    /// the metadata row, including the token signing key, on first run.
    pub fn initialize_desktop_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS db_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                schema_version INTEGER NOT NULL,
                token_signing_key BLOB NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                display_name TEXT NOT NULL,
                public_key BLOB NOT NULL,
                pairing_state TEXT NOT NULL,
                profile_scope TEXT NOT NULL,
                paired_at INTEGER NOT NULL,
                last_seen_at INTEGER,
                revoked_at INTEGER,
                wipe_pending INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS pairing_tickets (
                ticket_id TEXT PRIMARY KEY,
                ticket_hash BLOB NOT NULL UNIQUE,
                desktop_secret BLOB,
                desktop_public_key BLOB NOT NULL,
                ca_fingerprint TEXT NOT NULL,
                leaf_fingerprint TEXT NOT NULL,
                bootstrap_url TEXT NOT NULL,
                service_url TEXT NOT NULL,
                profile_scope TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                ttl_seconds INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                state TEXT NOT NULL,
                redeemed_at INTEGER,
                device_id TEXT
            );

            CREATE TABLE IF NOT EXISTS session_tokens (
                token_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                predecessor_token_id TEXT,
                state TEXT NOT NULL,
                state_changed_at INTEGER NOT NULL,
                FOREIGN KEY (device_id) REFERENCES devices(device_id)
            );

            CREATE TABLE IF NOT EXISTS profile_heads (
                profile_scope TEXT PRIMARY KEY,
                head_version INTEGER NOT NULL DEFAULT 0,
                retained_floor INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS entities (
                profile_scope TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload BLOB NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                committed_at INTEGER NOT NULL,
                PRIMARY KEY (profile_scope, entity_id)
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_entities_profile_version
                ON entities(profile_scope, version);
            CREATE INDEX IF NOT EXISTS idx_session_tokens_device
                ON session_tokens(device_id);
            CREATE INDEX IF NOT EXISTS idx_pairing_tickets_expires
                ON pairing_tickets(expires_at);
            CREATE INDEX IF NOT EXISTS idx_devices_profile
                ON devices(profile_scope);",
        )
        .map_err(DatabaseError::Sqlite)?;

        let signing_key: [u8; 32] = random_bytes();
        conn.execute(
            "INSERT OR IGNORE INTO db_metadata (id, schema_version, token_signing_key, created_at)
             VALUES (1, ?1, ?2, ?3)",
            rusqlite::params![
                CURRENT_SCHEMA_VERSION,
                signing_key.to_vec(),
                chrono::Utc::now().timestamp()
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        drop(conn);
        self.validate_schema_version()
    }

    /// Create the tables owned by the companion (cache) side.
    pub fn initialize_companion_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cached_entities (
                profile_scope TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                payload BLOB NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                committed_at INTEGER NOT NULL,
                applied_at INTEGER NOT NULL,
                PRIMARY KEY (profile_scope, entity_id)
            );

            CREATE TABLE IF NOT EXISTS sync_cursors (
                profile_scope TEXT PRIMARY KEY,
                last_seen_version INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS companion_credentials (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                device_id TEXT NOT NULL,
                bearer TEXT NOT NULL,
                profile_scope TEXT NOT NULL,
                ca_fingerprint TEXT NOT NULL,
                leaf_fingerprint TEXT NOT NULL,
                service_url TEXT NOT NULL,
                root_certificate BLOB NOT NULL,
                paired_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cached_entities_version
                ON cached_entities(profile_scope, version);",
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Fail if the file was written by a newer schema than this build knows.
    pub fn validate_schema_version(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: Option<i32> = conn
            .query_row(
                "SELECT schema_version FROM db_metadata WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        match version {
            Some(found) if found > CURRENT_SCHEMA_VERSION => Err(DatabaseError::UnsupportedSchema {
                found,
                supported: CURRENT_SCHEMA_VERSION,
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// HMAC key used to sign bearer tokens.
    pub fn token_signing_key(&self) -> Result<Vec<u8>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT token_signing_key FROM db_metadata WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .map_err(|e| DatabaseError::Sqlite(e).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(db: &Database, kind: &str) -> Vec<String> {
        let conn = db.conn().unwrap();
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = ?1")
            .unwrap();
        stmt.query_map([kind], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn desktop_schema_creates_tables() {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();

        let tables = names(&db, "table");
        for table in [
            "db_metadata",
            "devices",
            "pairing_tickets",
            "session_tokens",
            "profile_heads",
            "entities",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
        assert!(names(&db, "index").contains(&"idx_entities_profile_version".to_string()));
    }

    #[test]
    fn companion_schema_creates_tables() {
        let db = Database::in_memory().unwrap();
        db.initialize_companion_schema().unwrap();

        let tables = names(&db, "table");
        assert!(tables.contains(&"cached_entities".to_string()));
        assert!(tables.contains(&"sync_cursors".to_string()));
        assert!(tables.contains(&"companion_credentials".to_string()));
    }

    #[test]
    fn signing_key_survives_reinitialization() {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        let first = db.token_signing_key().unwrap();
        assert_eq!(first.len(), 32);

        db.initialize_desktop_schema().unwrap();
        assert_eq!(db.token_signing_key().unwrap(), first);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        db.conn()
            .unwrap()
            .execute("UPDATE db_metadata SET schema_version = 99 WHERE id = 1", [])
            .unwrap();

        assert!(db.validate_schema_version().is_err());
    }

    #[test]
    fn file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("desktop.db");

        let key = {
            let db = Database::open(&path).unwrap();
            db.initialize_desktop_schema().unwrap();
            db.token_signing_key().unwrap()
        };

        let db = Database::open(&path).unwrap();
        db.initialize_desktop_schema().unwrap();
        assert_eq!(db.token_signing_key().unwrap(), key);
    }
}
