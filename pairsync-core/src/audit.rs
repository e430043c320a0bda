//! Audit logging for pairing and trust events

use crate::{DatabaseError, PairSyncError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Audit log entry types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Certificate authority
    CaCreated {
        fingerprint: String,
    },
    LeafIssued {
        fingerprint: String,
        address: String,
        not_after: i64,
    },
    LeafRevoked {
        fingerprint: String,
    },

    /// Pairing tickets
    TicketIssued {
        ticket_id: String,
        profile_scope: String,
    },
    TicketCancelled {
        ticket_id: String,
    },
    TicketRedeemed {
        ticket_id: String,
        device_id: String,
    },
    RedemptionRejected {
        reason: String,
    },

    /// Sessions and devices
    TokenRotated {
        device_id: String,
    },
    DeviceRevoked {
        device_id: String,
    },
    AuthenticationRejected {
        reason: String,
    },

    /// Integrity
    FingerprintMismatch {
        expected: String,
        presented: String,
    },
    VersionGapDetected {
        profile_scope: String,
        since_version: u64,
    },

    /// System events
    DaemonStarted,
    DaemonStopped,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Timestamp of the event
    pub timestamp: DateTime<Utc>,

    /// Event type
    pub event_type: AuditEventType,

    /// Event severity (0-5, where 5 is most critical)
    pub severity: u8,

    /// Additional context data
    pub context: String,

    /// Process ID
    pub pid: Option<u32>,
}

/// Append-only JSON-lines audit logger.
///
/// Cheap to clone; clones share the file handle. A disabled logger accepts
/// events and drops them.
#[derive(Clone)]
pub struct AuditLogger {
    log_file: Option<PathBuf>,
    writer: Arc<Mutex<Option<File>>>,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("log_file", &self.log_file)
            .finish()
    }
}

impl AuditLogger {
    /// Create a logger writing to `<log_dir>/audit.log`
    pub fn new(log_dir: &Path) -> Result<Self> {
        let log_file = log_dir.join("audit.log");

        std::fs::create_dir_all(log_dir).map_err(|e| {
            PairSyncError::from(DatabaseError::FileIo(format!(
                "Failed to create audit log directory: {}",
                e
            )))
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .map_err(|e| {
                PairSyncError::from(DatabaseError::FileIo(format!(
                    "Failed to open audit log: {}",
                    e
                )))
            })?;

        info!("Audit logger initialized: {:?}", log_file);

        Ok(Self {
            log_file: Some(log_file),
            writer: Arc::new(Mutex::new(Some(file))),
        })
    }

    /// A logger that records nothing.
    pub fn disabled() -> Self {
        Self {
            log_file: None,
            writer: Arc::new(Mutex::new(None)),
        }
    }

    /// Log an audit event
    pub fn log(&self, event_type: AuditEventType, context: &str) -> Result<()> {
        let severity = Self::severity_for_event(&event_type);

        let entry = AuditEntry {
            timestamp: Utc::now(),
            event_type,
            severity,
            context: context.to_string(),
            pid: Some(std::process::id()),
        };

        let json = serde_json::to_string(&entry).map_err(|e| {
            PairSyncError::from(DatabaseError::Serialization(format!(
                "Failed to serialize audit entry: {}",
                e
            )))
        })?;

        let log_line = format!("{}\n", json);

        if let Some(ref mut writer) = *self.writer.lock().map_err(|_| {
            PairSyncError::from(DatabaseError::LockPoisoned(
                "Failed to lock audit writer".to_string(),
            ))
        })? {
            writer.write_all(log_line.as_bytes()).map_err(|e| {
                PairSyncError::from(DatabaseError::FileIo(format!(
                    "Failed to write audit log: {}",
                    e
                )))
            })?;
            writer.flush().map_err(|e| {
                PairSyncError::from(DatabaseError::FileIo(format!(
                    "Failed to flush audit log: {}",
                    e
                )))
            })?;
        }

        Ok(())
    }

    /// Log an event where the caller has no way to act on a write failure.
    pub fn record(&self, event_type: AuditEventType, context: &str) {
        if let Err(e) = self.log(event_type, context) {
            warn!("Audit write failed: {}", e);
        }
    }

    /// Get severity level for an event type (0-5)
    fn severity_for_event(event: &AuditEventType) -> u8 {
        match event {
            // Critical events (5)
            AuditEventType::FingerprintMismatch { .. } | AuditEventType::CaCreated { .. } => 5,

            // High severity (4)
            AuditEventType::DeviceRevoked { .. } | AuditEventType::TicketRedeemed { .. } => 4,

            // Medium-high severity (3)
            AuditEventType::RedemptionRejected { .. }
            | AuditEventType::VersionGapDetected { .. } => 3,

            // Medium severity (2)
            AuditEventType::TicketIssued { .. }
            | AuditEventType::TicketCancelled { .. }
            | AuditEventType::LeafRevoked { .. }
            | AuditEventType::AuthenticationRejected { .. } => 2,

            // Low severity (1)
            AuditEventType::LeafIssued { .. } | AuditEventType::TokenRotated { .. } => 1,

            // Info (0)
            AuditEventType::DaemonStarted | AuditEventType::DaemonStopped => 0,
        }
    }

    fn read_entries(&self) -> Result<Vec<AuditEntry>> {
        let Some(ref log_file) = self.log_file else {
            return Ok(Vec::new());
        };

        let content = std::fs::read_to_string(log_file).map_err(|e| {
            PairSyncError::from(DatabaseError::FileIo(format!(
                "Failed to read audit log: {}",
                e
            )))
        })?;

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditEntry>(line).ok())
            .collect())
    }

    /// Most recent entries, newest first
    pub fn get_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(self.read_entries()?.into_iter().rev().take(limit).collect())
    }

    /// Get audit entries by severity level
    pub fn get_entries_by_severity(&self, min_severity: u8) -> Result<Vec<AuditEntry>> {
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|entry| entry.severity >= min_severity)
            .collect())
    }
}
