//! Policy knobs for pairing, sessions, the local CA and sync.
//!
//! All structs deserialize with `serde(default)` so a config file only needs
//! to name the values it overrides.

use serde::{Deserialize, Serialize};

/// Pairing ticket policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingPolicy {
    /// Lifetime of a pairing ticket. Hard deadline enforced on redemption.
    pub ticket_ttl_secs: i64,
    /// Maximum number of Issued, unexpired tickets at any time.
    pub max_outstanding_tickets: usize,
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self {
            ticket_ttl_secs: 30,
            max_outstanding_tickets: 5,
        }
    }
}

/// Session token policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Lifetime of a freshly minted token.
    pub token_lifetime_secs: i64,
    /// How long a rotated-away token keeps working.
    pub grace_secs: i64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            token_lifetime_secs: 300,
            grace_secs: 30,
        }
    }
}

/// Local certificate authority policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaPolicy {
    /// Common name written into the root certificate.
    pub common_name: String,
    /// Validity of the root certificate.
    pub root_validity_days: i64,
    /// Lifetime used when a caller does not ask for one.
    pub default_leaf_lifetime_secs: i64,
    /// Upper bound on any leaf lifetime.
    pub max_leaf_lifetime_secs: i64,
    /// Renew the serving leaf when it has less than this much validity left.
    pub leaf_renew_before_secs: i64,
}

impl Default for CaPolicy {
    fn default() -> Self {
        Self {
            common_name: "pairsync local CA".to_string(),
            root_validity_days: 3650,
            default_leaf_lifetime_secs: 86_400,
            max_leaf_lifetime_secs: 7 * 86_400,
            leaf_renew_before_secs: 3600,
        }
    }
}

/// Delta synchronization policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Batch size used when a pull does not specify one.
    pub default_batch_size: usize,
    /// Ceiling applied to any requested batch size.
    pub max_batch_size: usize,
    /// Per-device push buffer; a device that falls this far behind is dropped
    /// from the push path and resumes by pulling.
    pub push_buffer: usize,
    /// Tombstones older than this are pruned.
    pub tombstone_retention_secs: i64,
    /// Interval between heartbeats on an open duplex channel.
    pub heartbeat_secs: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            default_batch_size: 500,
            max_batch_size: 5000,
            push_buffer: 256,
            tombstone_retention_secs: 90 * 86_400,
            heartbeat_secs: 15,
        }
    }
}

impl SyncPolicy {
    /// Resolve a requested batch size against the default and the ceiling.
    pub fn batch_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_batch_size)
            .clamp(1, self.max_batch_size)
    }
}

/// Companion-side retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per pull before giving up with `TransportInterrupted`.
    pub max_attempts: u32,
    /// First backoff delay; doubles on every further attempt.
    pub base_backoff_ms: u64,
    /// Cap on a single backoff delay.
    pub max_backoff_ms: u64,
    /// A duplex channel silent for this long is abandoned and reconnected.
    pub idle_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 250,
            max_backoff_ms: 30_000,
            idle_timeout_secs: 45,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms)
    }
}

/// Everything the core needs, grouped for config files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pairing: PairingPolicy,
    pub session: SessionPolicy,
    pub ca: CaPolicy,
    pub sync: SyncPolicy,
}
