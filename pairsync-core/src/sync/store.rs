//! Desktop profile store.
//!
//! Single writer per profile: a per-profile lock serializes commits, and each
//! commit bumps `profile_heads.head_version` and writes the entity in the
//! same transaction. Delta reads run as one statement on the same
//! connection, so they never see a version without its data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::models::{DeltaBatch, VersionedEntity};
use super::SyncError;
use crate::clock::SharedClock;
use crate::{Database, DatabaseError, PairSyncError, Result};

const ENTITY_COLUMNS: &str = "entity_id, profile_scope, version, payload, deleted, committed_at";

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<VersionedEntity> {
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

/// `(head_version, retained_floor)` of a profile; zeros if it has no writes.
fn profile_head(conn: &Connection, profile_scope: &str) -> Result<(u64, u64)> {
    let head = conn
        .query_row(
            "SELECT head_version, retained_floor FROM profile_heads WHERE profile_scope = ?1",
            [profile_scope],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(head.map(|(h, f)| (h as u64, f as u64)).unwrap_or((0, 0)))
}

/// Entities of a profile with `version > since`, ascending, at most `limit`.
fn read_range(
    conn: &Connection,
    profile_scope: &str,
    since: u64,
    limit: usize,
) -> Result<(Vec<VersionedEntity>, bool)> {
    // One extra row tells whether another page follows.
    let fetch = limit.saturating_add(1).min(i64::MAX as usize) as i64;
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {} FROM entities
             WHERE profile_scope = ?1 AND version > ?2
             ORDER BY version ASC LIMIT ?3",
            ENTITY_COLUMNS
        ))
        .map_err(DatabaseError::Sqlite)?;
    let mut entities = stmt
        .query_map(
            rusqlite::params![profile_scope, since as i64, fetch],
            row_to_entity,
        )
        .map_err(DatabaseError::Sqlite)?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(DatabaseError::Sqlite)?;

    let has_more = entities.len() > limit;
    entities.truncate(limit);
    Ok((entities, has_more))
}

/// Highest version a page accounts for. The last page covers up to the head:
/// versions past the final entity were overwritten or pruned.
fn covered_version(entities: &[VersionedEntity], has_more: bool, since: u64, head: u64) -> u64 {
    let last = entities.last().map(|e| e.version).unwrap_or(since);
    if has_more {
        last
    } else {
        last.max(head)
    }
}

/// Authoritative versioned store on the desktop.
#[derive(Clone)]
pub struct ProfileStore {
    db: Database,
    clock: SharedClock,
    writers: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ProfileStore {
    pub fn new(db: Database, clock: SharedClock) -> Self {
        Self {
            db,
            clock,
            writers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn writer_lock(&self, profile_scope: &str) -> Result<Arc<Mutex<()>>> {
        let mut writers = self
            .writers
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned("profile writer map".to_string()))?;
        Ok(writers
            .entry(profile_scope.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Create or replace an entity. Returns it at its new version.
    pub fn commit(&self, profile_scope: &str, entity_id: &str, payload: &[u8]) -> Result<VersionedEntity> {
        self.write(profile_scope, entity_id, payload, false)
    }

    /// Record a tombstone for an entity. `None` if there is nothing live to
    /// delete.
    pub fn delete(&self, profile_scope: &str, entity_id: &str) -> Result<Option<VersionedEntity>> {
        match self.get(profile_scope, entity_id)? {
            Some(existing) if !existing.deleted => {
                self.write(profile_scope, entity_id, &[], true).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn write(
        &self,
        profile_scope: &str,
        entity_id: &str,
        payload: &[u8],
        deleted: bool,
    ) -> Result<VersionedEntity> {
        if profile_scope.is_empty() || entity_id.is_empty() {
            return Err(PairSyncError::InvalidInput(
                "profile scope and entity id must not be empty".to_string(),
            ));
        }

        let lock = self.writer_lock(profile_scope)?;
        let _writer = lock
            .lock()
            .map_err(|_| DatabaseError::LockPoisoned(format!("writer for {}", profile_scope)))?;

        let now = self.clock.now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        tx.execute(
            "INSERT INTO profile_heads (profile_scope, head_version, retained_floor)
             VALUES (?1, 0, 0) ON CONFLICT(profile_scope) DO NOTHING",
            [profile_scope],
        )
        .map_err(DatabaseError::Sqlite)?;
        tx.execute(
            "UPDATE profile_heads SET head_version = head_version + 1 WHERE profile_scope = ?1",
            [profile_scope],
        )
        .map_err(DatabaseError::Sqlite)?;
        let version: i64 = tx
            .query_row(
                "SELECT head_version FROM profile_heads WHERE profile_scope = ?1",
                [profile_scope],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Sqlite)?;

        tx.execute(
            &format!(
                "INSERT INTO entities ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(profile_scope, entity_id) DO UPDATE SET
                    version = excluded.version,
                    payload = excluded.payload,
                    deleted = excluded.deleted,
                    committed_at = excluded.committed_at",
                ENTITY_COLUMNS
            ),
            rusqlite::params![entity_id, profile_scope, version, payload, deleted, now],
        )
        .map_err(DatabaseError::Sqlite)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        debug!(
            "Committed {} {} at version {}",
            if deleted { "tombstone" } else { "entity" },
            entity_id,
            version
        );

        Ok(VersionedEntity {
            entity_id: entity_id.to_string(),
            profile_scope: profile_scope.to_string(),
            version: version as u64,
            payload: payload.to_vec(),
            deleted,
            committed_at: now,
        })
    }

    /// Current entity state, tombstones included.
    pub fn get(&self, profile_scope: &str, entity_id: &str) -> Result<Option<VersionedEntity>> {
        let conn = self.db.conn()?;
        let entity = conn
            .query_row(
                &format!(
                    "SELECT {} FROM entities WHERE profile_scope = ?1 AND entity_id = ?2",
                    ENTITY_COLUMNS
                ),
                [profile_scope, entity_id],
                row_to_entity,
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?;
        Ok(entity)
    }

    /// Live entities of a profile ordered by id.
    pub fn list(&self, profile_scope: &str) -> Result<Vec<VersionedEntity>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM entities WHERE profile_scope = ?1 AND deleted = 0 ORDER BY entity_id",
                ENTITY_COLUMNS
            ))
            .map_err(DatabaseError::Sqlite)?;
        let entities = stmt
            .query_map([profile_scope], row_to_entity)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(entities)
    }

    /// Highest committed version of a profile.
    pub fn head_version(&self, profile_scope: &str) -> Result<u64> {
        let conn = self.db.conn()?;
        Ok(profile_head(&conn, profile_scope)?.0)
    }

    /// Oldest cursor the store can still serve incrementally.
    pub fn retained_floor(&self, profile_scope: &str) -> Result<u64> {
        let conn = self.db.conn()?;
        Ok(profile_head(&conn, profile_scope)?.1)
    }

    /// Everything in `profile_scope` committed after `since_version`,
    /// ascending, at most `max_batch_size` entries.
    ///
    /// A cursor of zero always succeeds. A non-zero cursor below the retained
    /// floor, or ahead of the head, is a [`SyncError::VersionGap`].
    pub fn compute_delta(
        &self,
        profile_scope: &str,
        since_version: u64,
        max_batch_size: usize,
    ) -> Result<DeltaBatch> {
        let conn = self.db.conn()?;
        let (head, floor) = profile_head(&conn, profile_scope)?;

        if since_version > 0 && (since_version < floor || since_version > head) {
            return Err(SyncError::VersionGap {
                profile_scope: profile_scope.to_string(),
                since_version,
                retained_floor: floor,
            }
            .into());
        }

        let (entities, has_more) = read_range(&conn, profile_scope, since_version, max_batch_size.max(1))?;
        let max_version = covered_version(&entities, has_more, since_version, head);

        debug!(
            "Delta for {}: ({}, {}] with {} entities, has_more={}",
            profile_scope,
            since_version,
            max_version,
            entities.len(),
            has_more
        );

        Ok(DeltaBatch {
            profile_scope: profile_scope.to_string(),
            since_version,
            max_version,
            entities,
            has_more,
            reset: false,
        })
    }

    /// One page of a full snapshot. No gap check; the first page
    /// (`after_version == 0`) is flagged `reset`.
    pub fn snapshot_page(
        &self,
        profile_scope: &str,
        after_version: u64,
        max_batch_size: usize,
    ) -> Result<DeltaBatch> {
        let conn = self.db.conn()?;
        let (head, _) = profile_head(&conn, profile_scope)?;
        let (entities, has_more) = read_range(&conn, profile_scope, after_version, max_batch_size.max(1))?;
        let max_version = covered_version(&entities, has_more, after_version, head);

        Ok(DeltaBatch {
            profile_scope: profile_scope.to_string(),
            since_version: after_version,
            max_version,
            entities,
            has_more,
            reset: after_version == 0,
        })
    }

    /// Delete tombstones committed before `now - retention_secs` and raise
    /// each profile's retained floor past them. Returns how many were removed.
    pub fn prune_tombstones(&self, retention_secs: i64) -> Result<usize> {
        let cutoff = self.clock.now() - retention_secs;
        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        tx.execute(
            "UPDATE profile_heads SET retained_floor = MAX(retained_floor, COALESCE((
                SELECT MAX(e.version) FROM entities e
                WHERE e.profile_scope = profile_heads.profile_scope
                  AND e.deleted = 1 AND e.committed_at < ?1), 0))",
            [cutoff],
        )
        .map_err(DatabaseError::Sqlite)?;
        let removed = tx
            .execute(
                "DELETE FROM entities WHERE deleted = 1 AND committed_at < ?1",
                [cutoff],
            )
            .map_err(DatabaseError::Sqlite)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        if removed > 0 {
            info!("Pruned {} tombstones committed before {}", removed, cutoff);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (ManualClock, ProfileStore) {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        let clock = ManualClock::new(1000);
        let store = ProfileStore::new(db, clock.shared());
        (clock, store)
    }

    fn versions(batch: &DeltaBatch) -> Vec<u64> {
        batch.entities.iter().map(|e| e.version).collect()
    }

    #[test]
    fn versions_are_monotonic_per_profile() {
        let (_, store) = store();
        assert_eq!(store.commit("personal", "a", b"1").unwrap().version, 1);
        assert_eq!(store.commit("personal", "b", b"2").unwrap().version, 2);
        assert_eq!(store.commit("work", "a", b"x").unwrap().version, 1);
        assert_eq!(store.commit("personal", "a", b"3").unwrap().version, 3);

        assert_eq!(store.head_version("personal").unwrap(), 3);
        assert_eq!(store.head_version("work").unwrap(), 1);
        assert_eq!(store.head_version("empty").unwrap(), 0);
        assert_eq!(store.get("personal", "a").unwrap().unwrap().payload, b"3");
    }

    #[test]
    fn delta_returns_versions_after_cursor() {
        // Profile at version 10, cursor 7: expect 8, 9, 10.
        let (_, store) = store();
        for i in 1..=10 {
            store.commit("personal", &format!("doc-{}", i), b"body").unwrap();
        }

        let batch = store.compute_delta("personal", 7, 500).unwrap();
        assert_eq!(versions(&batch), vec![8, 9, 10]);
        assert_eq!(batch.max_version, 10);
        assert!(!batch.has_more);
    }

    #[test]
    fn delta_is_truncated_with_has_more() {
        let (_, store) = store();
        for i in 1..=5 {
            store.commit("personal", &format!("doc-{}", i), b"body").unwrap();
        }

        let first = store.compute_delta("personal", 0, 2).unwrap();
        assert_eq!(versions(&first), vec![1, 2]);
        assert!(first.has_more);

        let second = store.compute_delta("personal", first.max_version, 2).unwrap();
        assert_eq!(versions(&second), vec![3, 4]);

        let last = store.compute_delta("personal", second.max_version, 2).unwrap();
        assert_eq!(versions(&last), vec![5]);
        assert!(!last.has_more);
    }

    #[test]
    fn rewritten_entity_appears_once_at_latest_version() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        store.commit("personal", "b", b"1").unwrap();
        store.commit("personal", "a", b"2").unwrap();

        let batch = store.compute_delta("personal", 0, 10).unwrap();
        assert_eq!(versions(&batch), vec![2, 3]);
        assert_eq!(batch.entities[1].entity_id, "a");
    }

    #[test]
    fn empty_delta_keeps_cursor() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        let batch = store.compute_delta("personal", 1, 10).unwrap();
        assert!(batch.is_empty());
        assert_eq!(batch.max_version, 1);
    }

    #[test]
    fn delete_writes_versioned_tombstone() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        let tombstone = store.delete("personal", "a").unwrap().unwrap();
        assert_eq!(tombstone.version, 2);
        assert!(tombstone.deleted);

        assert!(store.delete("personal", "a").unwrap().is_none());
        assert!(store.delete("personal", "missing").unwrap().is_none());
        assert!(store.list("personal").unwrap().is_empty());
    }

    #[test]
    fn pruned_tombstones_raise_floor() {
        let (clock, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        store.commit("personal", "b", b"1").unwrap();
        store.delete("personal", "a").unwrap();
        store.commit("personal", "c", b"1").unwrap();

        clock.advance(100);
        assert_eq!(store.prune_tombstones(50).unwrap(), 1);
        assert_eq!(store.retained_floor("personal").unwrap(), 3);

        match store.compute_delta("personal", 2, 10) {
            Err(PairSyncError::Sync(SyncError::VersionGap { retained_floor, .. })) => {
                assert_eq!(retained_floor, 3)
            }
            other => panic!("expected version gap, got {:?}", other),
        }
        assert_eq!(versions(&store.compute_delta("personal", 3, 10).unwrap()), vec![4]);
        assert!(store.compute_delta("personal", 0, 10).is_ok());
    }

    #[test]
    fn last_page_covers_overwritten_versions() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        store.commit("personal", "b", b"1").unwrap();
        store.commit("personal", "a", b"2").unwrap();
        store.commit("personal", "a", b"3").unwrap();

        let batch = store.compute_delta("personal", 1, 10).unwrap();
        assert_eq!(versions(&batch), vec![2, 4]);
        assert_eq!(batch.max_version, 4);

        let snapshot = store.snapshot_page("personal", 0, 10).unwrap();
        assert_eq!(snapshot.max_version, 4);
    }

    #[test]
    fn cursor_ahead_of_head_is_a_gap() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        assert!(matches!(
            store.compute_delta("personal", 5, 10),
            Err(PairSyncError::Sync(SyncError::VersionGap { .. }))
        ));
    }

    #[test]
    fn recent_tombstones_are_kept() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        store.delete("personal", "a").unwrap();
        assert_eq!(store.prune_tombstones(50).unwrap(), 0);
        assert_eq!(store.retained_floor("personal").unwrap(), 0);
    }

    #[test]
    fn snapshot_pages_cover_everything() {
        let (_, store) = store();
        for i in 1..=5 {
            store.commit("personal", &format!("doc-{}", i), b"body").unwrap();
        }

        let first = store.snapshot_page("personal", 0, 3).unwrap();
        assert!(first.reset);
        assert!(first.has_more);
        let second = store.snapshot_page("personal", first.max_version, 3).unwrap();
        assert!(!second.reset);
        assert!(!second.has_more);
        assert_eq!(versions(&second), vec![4, 5]);
    }

    #[test]
    fn concurrent_commits_get_distinct_versions() {
        let (_, store) = store();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store
                            .commit("personal", &format!("t{}-{}", t, i), b"x")
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let batch = store.compute_delta("personal", 0, 1000).unwrap();
        assert_eq!(versions(&batch), (1..=100).collect::<Vec<u64>>());
    }

    #[test]
    fn unbounded_batch_size_returns_everything() {
        let (_, store) = store();
        store.commit("personal", "a", b"1").unwrap();
        store.commit("personal", "b", b"1").unwrap();

        let batch = store.compute_delta("personal", 0, usize::MAX).unwrap();
        assert_eq!(versions(&batch), vec![1, 2]);
        assert!(!batch.has_more);

        let page = store.snapshot_page("personal", 0, usize::MAX).unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.max_version, 2);
    }

    #[test]
    fn empty_ids_are_rejected() {
        let (_, store) = store();
        assert!(matches!(
            store.commit("", "a", b"1"),
            Err(PairSyncError::InvalidInput(_))
        ));
        assert!(store.commit("personal", "", b"1").is_err());
    }
}
