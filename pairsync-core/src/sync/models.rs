//! Sync data models shared by the desktop, the companion and the wire.

use serde::{Deserialize, Serialize};

use super::SyncError;

/// One syncable record at one version.
///
/// `version` is assigned by the desktop at commit time, strictly increasing
/// within a profile and never reused. A deletion is a versioned tombstone
/// (`deleted = true`, empty payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub entity_id: String,
    pub profile_scope: String,
    pub version: u64,
    /// Opaque record body; the record store owns its schema.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub deleted: bool,
    pub committed_at: i64,
}

/// Ordered changes of one profile in `(since_version, max_version]`.
///
/// The same shape is used by pull responses, snapshot pages and pushed
/// changes, so every path ends in the same apply routine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub profile_scope: String,
    pub since_version: u64,
    /// Highest version covered; the cursor advances to this after apply.
    pub max_version: u64,
    pub entities: Vec<VersionedEntity>,
    /// More changes exist past `max_version`.
    pub has_more: bool,
    /// First page of a full snapshot: the receiver drops its copy of the
    /// profile before applying.
    #[serde(default)]
    pub reset: bool,
}

impl DeltaBatch {
    /// A batch that carries nothing and leaves the cursor at `since_version`.
    pub fn empty(profile_scope: &str, since_version: u64) -> Self {
        Self {
            profile_scope: profile_scope.to_string(),
            since_version,
            max_version: since_version,
            entities: Vec::new(),
            has_more: false,
            reset: false,
        }
    }

    /// A pushed single-entity change.
    pub fn single(entity: VersionedEntity) -> Self {
        Self {
            profile_scope: entity.profile_scope.clone(),
            since_version: entity.version.saturating_sub(1),
            max_version: entity.version,
            entities: vec![entity],
            has_more: false,
            reset: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Structural checks every well-formed batch passes.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.max_version < self.since_version {
            return Err(SyncError::ApplyIntegrityViolation(format!(
                "max_version {} precedes since_version {}",
                self.max_version, self.since_version
            )));
        }

        let mut previous = self.since_version;
        for entity in &self.entities {
            if entity.profile_scope != self.profile_scope {
                return Err(SyncError::ApplyIntegrityViolation(format!(
                    "entity {} belongs to profile {}, batch is for {}",
                    entity.entity_id, entity.profile_scope, self.profile_scope
                )));
            }
            if entity.version <= previous || entity.version > self.max_version {
                return Err(SyncError::ApplyIntegrityViolation(format!(
                    "entity {} version {} out of order in ({}, {}]",
                    entity.entity_id, entity.version, self.since_version, self.max_version
                )));
            }
            previous = entity.version;
        }
        Ok(())
    }
}

/// Messages on an open duplex channel, desktop to companion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// A committed change.
    Change(DeltaBatch),
    /// Keep-alive carrying the profile head; a companion behind it pulls.
    Heartbeat { head_version: u64 },
    /// The companion must discard its copy and take a full snapshot.
    Resync,
    /// The device was revoked; purge all cached data.
    Wipe,
}

/// Delta pull request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub since_version: u64,
    pub max_batch_size: Option<usize>,
}

/// Snapshot page request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub after_version: u64,
    pub max_batch_size: Option<usize>,
}

/// Custom base64 serialization for `Vec<u8>`.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
