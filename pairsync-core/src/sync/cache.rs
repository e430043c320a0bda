//! Companion-side cache.
//!
//! Every incoming batch, pulled or pushed, goes through
//! [`CompanionCache::apply_delta`]. Applying is idempotent: an entity is only
//! written if its version is not older than the cached one, and the cursor
//! only moves forward. Entity writes and the cursor update share one
//! transaction, so a crash never leaves the cursor ahead of the data.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::models::{DeltaBatch, VersionedEntity};
use super::SyncError;
use crate::ca::PinnedPeer;
use crate::clock::SharedClock;
use crate::device::corrupt_column;
use crate::{Database, DatabaseError, Result};

/// Result of applying one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The batch was applied; `upserted` entities were written.
    Applied { cursor: u64, upserted: usize },
    /// The batch starts past the cursor. Nothing was written; pull from
    /// `cursor` to close the hole.
    NeedsPull { cursor: u64 },
}

const CACHED_COLUMNS: &str = "entity_id, profile_scope, version, payload, deleted, committed_at";

fn row_to_cached(row: &Row<'_>) -> rusqlite::Result<VersionedEntity> {
    let version: i64 = row.get(2)?;
    Ok(VersionedEntity {
        entity_id: row.get(0)?,
        profile_scope: row.get(1)?,
        version: version as u64,
        payload: row.get(3)?,
        deleted: row.get(4)?,
        committed_at: row.get(5)?,
    })
}

fn read_cursor(conn: &Connection, profile_scope: &str) -> Result<u64> {
    let cursor: Option<i64> = conn
        .query_row(
            "SELECT last_seen_version FROM sync_cursors WHERE profile_scope = ?1",
            [profile_scope],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(cursor.unwrap_or(0) as u64)
}

fn write_cursor(conn: &Connection, profile_scope: &str, cursor: u64, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_cursors (profile_scope, last_seen_version, updated_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(profile_scope) DO UPDATE SET
            last_seen_version = excluded.last_seen_version,
            updated_at = excluded.updated_at",
        rusqlite::params![profile_scope, cursor as i64, now],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Read-only replica of one profile held by a companion.
#[derive(Clone)]
pub struct CompanionCache {
    db: Database,
    clock: SharedClock,
    profile_scope: String,
}

impl CompanionCache {
    pub fn new(db: Database, clock: SharedClock, profile_scope: &str) -> Self {
        Self {
            db,
            clock,
            profile_scope: profile_scope.to_string(),
        }
    }

    pub fn profile_scope(&self) -> &str {
        &self.profile_scope
    }

    /// Last version applied for this profile.
    pub fn cursor(&self) -> Result<u64> {
        let conn = self.db.conn()?;
        read_cursor(&conn, &self.profile_scope)
    }

    /// Apply a delta batch, snapshot page or pushed change.
    pub fn apply_delta(&self, batch: &DeltaBatch) -> Result<ApplyOutcome> {
        batch.validate()?;
        if batch.profile_scope != self.profile_scope {
            return Err(SyncError::ApplyIntegrityViolation(format!(
                "batch for profile {} applied to cache of {}",
                batch.profile_scope, self.profile_scope
            ))
            .into());
        }

        let now = self.clock.now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        if batch.reset {
            let dropped = tx
                .execute(
                    "DELETE FROM cached_entities WHERE profile_scope = ?1",
                    [&self.profile_scope],
                )
                .map_err(DatabaseError::Sqlite)?;
            write_cursor(&tx, &self.profile_scope, 0, now)?;
            info!(
                "Snapshot reset for {}: dropped {} cached entities",
                self.profile_scope, dropped
            );
        }

        let cursor = read_cursor(&tx, &self.profile_scope)?;
        if batch.since_version > cursor {
            debug!(
                "Batch ({}, {}] is ahead of cursor {}",
                batch.since_version, batch.max_version, cursor
            );
            return Ok(ApplyOutcome::NeedsPull { cursor });
        }

        let mut upserted = 0;
        {
            let mut stmt = tx
                .prepare_cached(&format!(
                    "INSERT INTO cached_entities ({}, applied_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(profile_scope, entity_id) DO UPDATE SET
                        version = excluded.version,
                        payload = excluded.payload,
                        deleted = excluded.deleted,
                        committed_at = excluded.committed_at,
                        applied_at = excluded.applied_at
                     WHERE excluded.version >= cached_entities.version",
                    CACHED_COLUMNS
                ))
                .map_err(DatabaseError::Sqlite)?;
            for entity in &batch.entities {
                upserted += stmt
                    .execute(rusqlite::params![
                        entity.entity_id,
                        entity.profile_scope,
                        entity.version as i64,
                        entity.payload,
                        entity.deleted,
                        entity.committed_at,
                        now,
                    ])
                    .map_err(DatabaseError::Sqlite)?;
            }
        }

        let new_cursor = cursor.max(batch.max_version);
        write_cursor(&tx, &self.profile_scope, new_cursor, now)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        if upserted > 0 || new_cursor != cursor {
            debug!(
                "Applied {} entities to {}; cursor {} -> {}",
                upserted, self.profile_scope, cursor, new_cursor
            );
        }
        Ok(ApplyOutcome::Applied {
            cursor: new_cursor,
            upserted,
        })
    }

    /// A live cached entity.
    pub fn get(&self, entity_id: &str) -> Result<Option<VersionedEntity>> {
        let conn = self.db.conn()?;
        let entity = conn
            .query_row(
                &format!(
                    "SELECT {} FROM cached_entities
                     WHERE profile_scope = ?1 AND entity_id = ?2 AND deleted = 0",
                    CACHED_COLUMNS
                ),
                [self.profile_scope.as_str(), entity_id],
                row_to_cached,
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(entity)
    }

    /// All live cached entities ordered by id.
    pub fn list(&self) -> Result<Vec<VersionedEntity>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM cached_entities
                 WHERE profile_scope = ?1 AND deleted = 0 ORDER BY entity_id",
                CACHED_COLUMNS
            ))
            .map_err(DatabaseError::Sqlite)?;
        let entities = stmt
            .query_map([&self.profile_scope], row_to_cached)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(entities)
    }

    /// Drop the cached copy of this profile and rewind the cursor.
    pub fn clear_profile(&self) -> Result<()> {
        let now = self.clock.now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;
        tx.execute(
            "DELETE FROM cached_entities WHERE profile_scope = ?1",
            [&self.profile_scope],
        )
        .map_err(DatabaseError::Sqlite)?;
        write_cursor(&tx, &self.profile_scope, 0, now)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;
        warn!("Cleared cached profile {}", self.profile_scope);
        Ok(())
    }

    /// Remove every cached entity, cursor and stored credential.
    pub fn purge(&self) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute_batch(
            "BEGIN;
             DELETE FROM cached_entities;
             DELETE FROM sync_cursors;
             DELETE FROM companion_credentials;
             COMMIT;",
        )
        .map_err(DatabaseError::Sqlite)?;
        warn!("Purged all cached data and credentials");
        Ok(())
    }
}

/// What a paired companion keeps about its desktop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionCredentials {
    pub device_id: Uuid,
    pub bearer: String,
    pub profile_scope: String,
    pub ca_fingerprint: String,
    pub leaf_fingerprint: String,
    pub service_url: String,
    /// DER of the pinned root certificate.
    pub root_certificate: Vec<u8>,
    pub paired_at: i64,
}

impl std::fmt::Debug for CompanionCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionCredentials")
            .field("device_id", &self.device_id)
            .field("profile_scope", &self.profile_scope)
            .field("ca_fingerprint", &self.ca_fingerprint)
            .field("leaf_fingerprint", &self.leaf_fingerprint)
            .field("service_url", &self.service_url)
            .field("paired_at", &self.paired_at)
            .finish_non_exhaustive()
    }
}

impl CompanionCredentials {
    pub fn pinned_peer(&self) -> PinnedPeer {
        PinnedPeer::new(&self.ca_fingerprint, &self.leaf_fingerprint)
    }

    /// Store as the single credential record, replacing any previous one.
    pub fn save(&self, db: &Database) -> Result<()> {
        let conn = db.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO companion_credentials
             (id, device_id, bearer, profile_scope, ca_fingerprint, leaf_fingerprint,
              service_url, root_certificate, paired_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                self.device_id.to_string(),
                self.bearer,
                self.profile_scope,
                self.ca_fingerprint,
                self.leaf_fingerprint,
                self.service_url,
                self.root_certificate,
                self.paired_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    pub fn load(db: &Database) -> Result<Option<Self>> {
        let conn = db.conn()?;
        let credentials = conn
            .query_row(
                "SELECT device_id, bearer, profile_scope, ca_fingerprint, leaf_fingerprint,
                        service_url, root_certificate, paired_at
                 FROM companion_credentials WHERE id = 1",
                [],
                |row| {
                    let device_id: String = row.get(0)?;
                    Ok(CompanionCredentials {
                        device_id: Uuid::parse_str(&device_id)
                            .map_err(|e| corrupt_column(0, e.to_string()))?,
                        bearer: row.get(1)?,
                        profile_scope: row.get(2)?,
                        ca_fingerprint: row.get(3)?,
                        leaf_fingerprint: row.get(4)?,
                        service_url: row.get(5)?,
                        root_certificate: row.get(6)?,
                        paired_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(credentials)
    }

    /// Persist a rotated bearer.
    pub fn update_bearer(&mut self, db: &Database, bearer: String) -> Result<()> {
        let conn = db.conn()?;
        conn.execute(
            "UPDATE companion_credentials SET bearer = ?1 WHERE id = 1",
            [&bearer],
        )
        .map_err(DatabaseError::Sqlite)?;
        self.bearer = bearer;
        Ok(())
    }
}
