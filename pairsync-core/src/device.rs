//! Paired device records.
//!
//! A device row is created `Pending` when a pairing ticket is redeemed, moves
//! to `Paired` on its first authenticated request, and ends `Revoked`. Rows
//! are never deleted so the audit history keeps a subject.

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Database, DatabaseError, Result};

/// Role of a device in the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Primary,
    Companion,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Primary => "primary",
            DeviceRole::Companion => "companion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(DeviceRole::Primary),
            "companion" => Some(DeviceRole::Companion),
            _ => None,
        }
    }
}

/// Lifecycle of a device's trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingState {
    Pending,
    Paired,
    Revoked,
}

impl PairingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairingState::Pending => "pending",
            PairingState::Paired => "paired",
            PairingState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PairingState::Pending),
            "paired" => Some(PairingState::Paired),
            "revoked" => Some(PairingState::Revoked),
            _ => None,
        }
    }
}

/// A device known to the desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: Uuid,
    pub role: DeviceRole,
    pub display_name: String,
    /// X25519 public key presented at pairing.
    #[serde(with = "crate::sync::models::base64_bytes")]
    pub public_key: Vec<u8>,
    pub pairing_state: PairingState,
    pub profile_scope: String,
    pub paired_at: i64,
    pub last_seen_at: Option<i64>,
    pub revoked_at: Option<i64>,
    /// Set on revocation; the device's cache must be purged on next contact.
    pub wipe_pending: bool,
}

impl Device {
    /// A fresh companion record in the `Pending` state.
    pub fn new_companion(
        display_name: &str,
        public_key: Vec<u8>,
        profile_scope: &str,
        now: i64,
    ) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            role: DeviceRole::Companion,
            display_name: display_name.to_string(),
            public_key,
            pairing_state: PairingState::Pending,
            profile_scope: profile_scope.to_string(),
            paired_at: now,
            last_seen_at: None,
            revoked_at: None,
            wipe_pending: false,
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.pairing_state == PairingState::Revoked
    }
}

const DEVICE_COLUMNS: &str = "device_id, role, display_name, public_key, pairing_state, \
     profile_scope, paired_at, last_seen_at, revoked_at, wipe_pending";

fn row_to_device(row: &Row<'_>) -> rusqlite::Result<Device> {
    let id: String = row.get(0)?;
    let role: String = row.get(1)?;
    let state: String = row.get(4)?;

    Ok(Device {
        device_id: Uuid::parse_str(&id).map_err(|e| corrupt_column(0, e.to_string()))?,
        role: DeviceRole::parse(&role)
            .ok_or_else(|| corrupt_column(1, format!("unknown device role: {}", role)))?,
        display_name: row.get(2)?,
        public_key: row.get(3)?,
        pairing_state: PairingState::parse(&state)
            .ok_or_else(|| corrupt_column(4, format!("unknown pairing state: {}", state)))?,
        profile_scope: row.get(5)?,
        paired_at: row.get(6)?,
        last_seen_at: row.get(7)?,
        revoked_at: row.get(8)?,
        wipe_pending: row.get(9)?,
    })
}

/// Conversion error for a text column holding an unexpected value.
pub(crate) fn corrupt_column(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

/// Insert a device row. Runs on the caller's connection so pairing can do it
/// inside its redemption transaction.
pub(crate) fn insert_device(conn: &Connection, device: &Device) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO devices ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            DEVICE_COLUMNS
        ),
        rusqlite::params![
            device.device_id.to_string(),
            device.role.as_str(),
            device.display_name,
            device.public_key,
            device.pairing_state.as_str(),
            device.profile_scope,
            device.paired_at,
            device.last_seen_at,
            device.revoked_at,
            device.wipe_pending,
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

pub(crate) fn load_device(conn: &Connection, device_id: &Uuid) -> Result<Option<Device>> {
    let device = conn
        .query_row(
            &format!("SELECT {} FROM devices WHERE device_id = ?1", DEVICE_COLUMNS),
            [device_id.to_string()],
            row_to_device,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(device)
}

/// Mark a device revoked and flag the pending cache wipe. Returns false if
/// the device does not exist.
pub(crate) fn mark_revoked(conn: &Connection, device_id: &Uuid, now: i64) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE devices SET pairing_state = 'revoked', wipe_pending = 1,
                revoked_at = COALESCE(revoked_at, ?2)
             WHERE device_id = ?1",
            rusqlite::params![device_id.to_string(), now],
        )
        .map_err(DatabaseError::Sqlite)?;
    Ok(changed > 0)
}

/// Read/update access to the device table.
#[derive(Clone)]
pub struct DeviceRegistry {
    db: Database,
}

impl DeviceRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Look up a device by id.
    pub fn get(&self, device_id: &Uuid) -> Result<Option<Device>> {
        let conn = self.db.conn()?;
        load_device(&conn, device_id)
    }

    /// All devices, newest first.
    pub fn list(&self) -> Result<Vec<Device>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM devices ORDER BY paired_at DESC, device_id",
                DEVICE_COLUMNS
            ))
            .map_err(DatabaseError::Sqlite)?;
        let devices = stmt
            .query_map([], row_to_device)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(devices)
    }

    /// Clear the pending-wipe flag once the device has been told to purge.
    /// Returns whether a wipe was still owed.
    pub fn acknowledge_wipe(&self, device_id: &Uuid) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE devices SET wipe_pending = 0 WHERE device_id = ?1 AND wipe_pending = 1",
                [device_id.to_string()],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Database, DeviceRegistry) {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        (db.clone(), DeviceRegistry::new(db))
    }

    #[test]
    fn insert_and_get() {
        let (db, registry) = registry();
        let device = Device::new_companion("Phone", vec![9u8; 32], "personal", 100);
        insert_device(&db.conn().unwrap(), &device).unwrap();

        let loaded = registry.get(&device.device_id).unwrap().unwrap();
        assert_eq!(loaded, device);
        assert_eq!(loaded.pairing_state, PairingState::Pending);
        assert!(registry.get(&Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn revoked_device_flags_wipe() {
        let (db, registry) = registry();
        let device = Device::new_companion("Phone", vec![1u8; 32], "personal", 100);
        insert_device(&db.conn().unwrap(), &device).unwrap();

        assert!(mark_revoked(&db.conn().unwrap(), &device.device_id, 200).unwrap());
        assert!(!mark_revoked(&db.conn().unwrap(), &Uuid::new_v4(), 200).unwrap());

        let loaded = registry.get(&device.device_id).unwrap().unwrap();
        assert!(loaded.is_revoked());
        assert!(loaded.wipe_pending);
        assert_eq!(loaded.revoked_at, Some(200));

        assert!(registry.acknowledge_wipe(&device.device_id).unwrap());
        assert!(!registry.acknowledge_wipe(&device.device_id).unwrap());
        assert!(!registry.get(&device.device_id).unwrap().unwrap().wipe_pending);
    }

    #[test]
    fn list_is_newest_first() {
        let (db, registry) = registry();
        let a = Device::new_companion("A", vec![1u8; 32], "personal", 100);
        let b = Device::new_companion("B", vec![2u8; 32], "work", 200);
        {
            let conn = db.conn().unwrap();
            insert_device(&conn, &a).unwrap();
            insert_device(&conn, &b).unwrap();
        }

        assert_eq!(registry.list().unwrap().len(), 2);
        assert_eq!(registry.list().unwrap()[0].device_id, b.device_id);
    }
}
