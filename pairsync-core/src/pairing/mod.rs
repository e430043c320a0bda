//! Pairing coordinator.
//!
//! Ticket state machine:
//!
//! ```text
//! Issued --redeem--> Redeemed
//!    \
//!     `--TTL / cancel--> Expired
//! ```
//!
//! Redemption is a single check-and-set on the ticket row, committed in the
//! same transaction as the new device and its first session token. Any
//! failure leaves the ticket exactly as it was.

pub mod payload;

pub use payload::{BootstrapPayload, PAYLOAD_VERSION};

use rusqlite::{OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::{AuditEventType, AuditLogger};
use crate::clock::SharedClock;
use crate::config::PairingPolicy;
use crate::crypto::{self, decode_b64url, encode_b64url, random_bytes, sha256, KeyExchangePair};
use crate::device::{corrupt_column, insert_device, Device};
use crate::session::SessionTokenManager;
use crate::{Database, DatabaseError, PairSyncError, Result};

/// Pairing handshake failures. All are terminal for the attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("Pairing ticket expired")]
    TicketExpired,

    #[error("Pairing ticket already consumed")]
    TicketAlreadyConsumed,

    #[error("Pairing ticket not found")]
    TicketNotFound,

    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    #[error("Too many outstanding pairing tickets (limit {limit})")]
    TooManyOutstandingTickets { limit: usize },

    #[error("Invalid pairing payload: {0}")]
    InvalidPayload(String),
}

impl PairingError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            PairingError::TicketExpired => "ticket_expired",
            PairingError::TicketAlreadyConsumed => "ticket_already_consumed",
            PairingError::TicketNotFound => "ticket_not_found",
            PairingError::KeyExchangeFailed(_) => "key_exchange_failed",
            PairingError::TooManyOutstandingTickets { .. } => "too_many_outstanding_tickets",
            PairingError::InvalidPayload(_) => "invalid_payload",
        }
    }

    /// Rebuild an error from its code and message, as received over HTTP.
    pub fn from_code(code: &str, message: &str) -> Option<Self> {
        match code {
            "ticket_expired" => Some(PairingError::TicketExpired),
            "ticket_already_consumed" => Some(PairingError::TicketAlreadyConsumed),
            "ticket_not_found" => Some(PairingError::TicketNotFound),
            "key_exchange_failed" => Some(PairingError::KeyExchangeFailed(message.to_string())),
            "too_many_outstanding_tickets" => Some(PairingError::TooManyOutstandingTickets {
                limit: parse_limit(message).unwrap_or_default(),
            }),
            "invalid_payload" => Some(PairingError::InvalidPayload(message.to_string())),
            _ => None,
        }
    }
}

/// Limit from a "... (limit N)" message.
fn parse_limit(message: &str) -> Option<usize> {
    let (_, tail) = message.rsplit_once("limit ")?;
    tail.trim_end_matches(')').trim().parse().ok()
}

/// Ticket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketState {
    Issued,
    Redeemed,
    Expired,
}

impl TicketState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketState::Issued => "issued",
            TicketState::Redeemed => "redeemed",
            TicketState::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "issued" => Some(TicketState::Issued),
            "redeemed" => Some(TicketState::Redeemed),
            "expired" => Some(TicketState::Expired),
            _ => None,
        }
    }
}

/// Where and how the companion reaches and verifies this desktop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAnchor {
    pub ca_fingerprint: String,
    pub leaf_fingerprint: String,
    pub bootstrap_url: String,
    pub service_url: String,
}

/// Result of [`PairingCoordinator::issue_ticket`].
#[derive(Debug, Clone)]
pub struct IssuedTicket {
    pub ticket_id: Uuid,
    pub payload: BootstrapPayload,
}

/// Operator view of a ticket. Carries no secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSummary {
    pub ticket_id: Uuid,
    pub profile_scope: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub state: TicketState,
    pub device_id: Option<Uuid>,
}

/// Companion → desktop redemption request.
#[derive(Clone, Serialize, Deserialize)]
pub struct RedeemRequest {
    /// Ticket value from the payload (base64url).
    pub ticket: String,
    /// Companion X25519 public key (base64url).
    pub companion_public_key: String,
    pub display_name: String,
}

impl std::fmt::Debug for RedeemRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedeemRequest")
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// Desktop → companion redemption response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemResponse {
    pub device_id: Uuid,
    pub profile_scope: String,
    /// First bearer token sealed under the session-establishment key
    /// (base64url of `nonce || ciphertext || tag`).
    pub sealed_token: String,
    pub token_expires_at: i64,
}

/// Outcome of a successful redemption on the desktop.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub ticket_id: Uuid,
    pub device_id: Uuid,
    pub profile_scope: String,
    pub sealed_token: Vec<u8>,
    pub token_expires_at: i64,
}

impl Redemption {
    pub fn to_response(&self) -> RedeemResponse {
        RedeemResponse {
            device_id: self.device_id,
            profile_scope: self.profile_scope.clone(),
            sealed_token: encode_b64url(&self.sealed_token),
            token_expires_at: self.token_expires_at,
        }
    }
}

struct TicketRow {
    ticket_id: Uuid,
    state: TicketState,
    expires_at: i64,
    desktop_secret: Option<Zeroizing<Vec<u8>>>,
    profile_scope: String,
}

fn row_to_ticket(row: &Row<'_>) -> rusqlite::Result<TicketRow> {
    let ticket_id: String = row.get(0)?;
    let state: String = row.get(1)?;
    let secret: Option<Vec<u8>> = row.get(3)?;
    Ok(TicketRow {
        ticket_id: Uuid::parse_str(&ticket_id).map_err(|e| corrupt_column(0, e.to_string()))?,
        state: TicketState::parse(&state)
            .ok_or_else(|| corrupt_column(1, format!("unknown ticket state: {}", state)))?,
        expires_at: row.get(2)?,
        desktop_secret: secret.map(Zeroizing::new),
        profile_scope: row.get(4)?,
    })
}

/// Map a ticket that cannot be redeemed at `now` to its error.
fn classify(state: TicketState, expires_at: i64, now: i64) -> std::result::Result<(), PairingError> {
    match state {
        TicketState::Redeemed => Err(PairingError::TicketAlreadyConsumed),
        TicketState::Expired => Err(PairingError::TicketExpired),
        TicketState::Issued if now >= expires_at => Err(PairingError::TicketExpired),
        TicketState::Issued => Ok(()),
    }
}

/// Issues and redeems one-time pairing tickets.
#[derive(Clone)]
pub struct PairingCoordinator {
    db: Database,
    clock: SharedClock,
    policy: PairingPolicy,
    sessions: SessionTokenManager,
    audit: AuditLogger,
}

impl PairingCoordinator {
    pub fn new(
        db: Database,
        policy: PairingPolicy,
        sessions: SessionTokenManager,
        clock: SharedClock,
    ) -> Self {
        Self {
            db,
            clock,
            policy,
            sessions,
            audit: AuditLogger::disabled(),
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Create a ticket for `profile_scope` bound to a fresh desktop key pair
    /// and the given trust anchor.
    pub fn issue_ticket(&self, profile_scope: &str, anchor: &TrustAnchor) -> Result<IssuedTicket> {
        if profile_scope.trim().is_empty() {
            return Err(PairSyncError::InvalidInput(
                "profile scope must not be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let ttl = self.policy.ticket_ttl_secs;
        let expires_at = now + ttl;

        let ticket_value = Zeroizing::new(random_bytes::<32>());
        let ticket_hash = sha256(&ticket_value[..]);
        let keys = KeyExchangePair::generate();
        let secret = Zeroizing::new(keys.secret_bytes());
        let ticket_id = Uuid::new_v4();

        {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

            let outstanding: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM pairing_tickets WHERE state = 'issued' AND expires_at > ?1",
                    [now],
                    |row| row.get(0),
                )
                .map_err(DatabaseError::Sqlite)?;
            if outstanding as usize >= self.policy.max_outstanding_tickets {
                return Err(PairingError::TooManyOutstandingTickets {
                    limit: self.policy.max_outstanding_tickets,
                }
                .into());
            }

            tx.execute(
                "INSERT INTO pairing_tickets (
                    ticket_id, ticket_hash, desktop_secret, desktop_public_key,
                    ca_fingerprint, leaf_fingerprint, bootstrap_url, service_url,
                    profile_scope, issued_at, ttl_seconds, expires_at, state
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'issued')",
                rusqlite::params![
                    ticket_id.to_string(),
                    ticket_hash.to_vec(),
                    secret.to_vec(),
                    keys.public_key_bytes().to_vec(),
                    anchor.ca_fingerprint,
                    anchor.leaf_fingerprint,
                    anchor.bootstrap_url,
                    anchor.service_url,
                    profile_scope,
                    now,
                    ttl,
                    expires_at,
                ],
            )
            .map_err(DatabaseError::Sqlite)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
        }

        info!(
            "Issued pairing ticket {} for profile {} (expires {})",
            ticket_id, profile_scope, expires_at
        );
        self.audit.record(
            AuditEventType::TicketIssued {
                ticket_id: ticket_id.to_string(),
                profile_scope: profile_scope.to_string(),
            },
            "",
        );

        Ok(IssuedTicket {
            ticket_id,
            payload: BootstrapPayload {
                version: PAYLOAD_VERSION,
                ticket: encode_b64url(&ticket_value[..]),
                desktop_public_key: encode_b64url(&keys.public_key_bytes()),
                ca_fingerprint: anchor.ca_fingerprint.clone(),
                leaf_fingerprint: anchor.leaf_fingerprint.clone(),
                bootstrap_url: anchor.bootstrap_url.clone(),
                service_url: anchor.service_url.clone(),
                profile_scope: profile_scope.to_string(),
                expires_at,
            },
        })
    }

    /// Redeem a ticket.
    ///
    /// Exactly one concurrent caller can win a given ticket; the rest observe
    /// `TicketAlreadyConsumed`. On success the new device exists in the
    /// `Pending` state with one `Active` token, sealed for the companion.
    pub fn redeem_ticket(
        &self,
        ticket_value: &str,
        companion_public_key: &[u8],
        display_name: &str,
    ) -> Result<Redemption> {
        self.try_redeem(ticket_value, companion_public_key, display_name)
            .map_err(|e| {
                if let PairSyncError::Pairing(ref pe) = e {
                    warn!("Rejected pairing redemption: {}", pe);
                    self.audit.record(
                        AuditEventType::RedemptionRejected {
                            reason: pe.code().to_string(),
                        },
                        display_name,
                    );
                }
                e
            })
    }

    fn try_redeem(
        &self,
        ticket_value: &str,
        companion_public_key: &[u8],
        display_name: &str,
    ) -> Result<Redemption> {
        let ticket_bytes =
            Zeroizing::new(decode_b64url(ticket_value).map_err(|_| PairingError::TicketNotFound)?);
        let ticket_hash = sha256(&ticket_bytes);
        let now = self.clock.now();

        let ticket = {
            let conn = self.db.conn()?;
            conn.query_row(
                "SELECT ticket_id, state, expires_at, desktop_secret, profile_scope
                 FROM pairing_tickets WHERE ticket_hash = ?1",
                [ticket_hash.to_vec()],
                row_to_ticket,
            )
            .optional()
            .map_err(DatabaseError::Sqlite)?
            .ok_or(PairingError::TicketNotFound)?
        };
        classify(ticket.state, ticket.expires_at, now)?;

        // Key agreement runs outside the connection lock.
        let secret = ticket
            .desktop_secret
            .as_ref()
            .ok_or(PairingError::TicketExpired)?;
        let keys = KeyExchangePair::from_secret_bytes(secret)
            .map_err(|e| PairingError::KeyExchangeFailed(e.to_string()))?;
        let session_key = keys
            .derive_session_key(companion_public_key, &ticket_bytes)
            .map_err(|e| PairingError::KeyExchangeFailed(e.to_string()))?;

        let device = Device::new_companion(
            display_name,
            companion_public_key.to_vec(),
            &ticket.profile_scope,
            now,
        );

        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        let won = tx
            .execute(
                "UPDATE pairing_tickets
                 SET state = 'redeemed', redeemed_at = ?2, device_id = ?3, desktop_secret = NULL
                 WHERE ticket_id = ?1 AND state = 'issued' AND expires_at > ?2",
                rusqlite::params![ticket.ticket_id.to_string(), now, device.device_id.to_string()],
            )
            .map_err(DatabaseError::Sqlite)?;
        if won == 0 {
            let state: String = tx
                .query_row(
                    "SELECT state FROM pairing_tickets WHERE ticket_id = ?1",
                    [ticket.ticket_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(DatabaseError::Sqlite)?
                .ok_or(PairingError::TicketNotFound)?;
            let state = TicketState::parse(&state).unwrap_or(TicketState::Expired);
            classify(state, ticket.expires_at, now)?;
            return Err(PairingError::TicketExpired.into());
        }

        insert_device(&tx, &device)?;
        let issued = self.sessions.mint_in(&tx, &device.device_id, None, now)?;
        let sealed_token = crypto::seal(&session_key, issued.bearer.as_bytes())?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!(
            "Pairing ticket {} redeemed by device {} ({})",
            ticket.ticket_id, device.device_id, display_name
        );
        self.audit.record(
            AuditEventType::TicketRedeemed {
                ticket_id: ticket.ticket_id.to_string(),
                device_id: device.device_id.to_string(),
            },
            display_name,
        );

        Ok(Redemption {
            ticket_id: ticket.ticket_id,
            device_id: device.device_id,
            profile_scope: device.profile_scope,
            sealed_token,
            token_expires_at: issued.token.expires_at,
        })
    }

    /// Operator cancel of a not-yet-redeemed ticket.
    pub fn cancel_ticket(&self, ticket_id: &Uuid) -> Result<bool> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE pairing_tickets SET state = 'expired', desktop_secret = NULL
                 WHERE ticket_id = ?1 AND state = 'issued'",
                [ticket_id.to_string()],
            )
            .map_err(DatabaseError::Sqlite)?;
        if changed > 0 {
            info!("Cancelled pairing ticket {}", ticket_id);
            self.audit.record(
                AuditEventType::TicketCancelled {
                    ticket_id: ticket_id.to_string(),
                },
                "",
            );
        }
        Ok(changed > 0)
    }

    /// Move TTL-elapsed `Issued` tickets to `Expired` and erase their keys.
    pub fn expire_tickets(&self) -> Result<usize> {
        let now = self.clock.now();
        let conn = self.db.conn()?;
        let expired = conn
            .execute(
                "UPDATE pairing_tickets SET state = 'expired', desktop_secret = NULL
                 WHERE state = 'issued' AND expires_at <= ?1",
                [now],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(expired)
    }

    /// Delete finished tickets once their TTL window has closed. Until then
    /// the `Redeemed` marker rejects replays.
    pub fn purge_tickets(&self) -> Result<usize> {
        let now = self.clock.now();
        let conn = self.db.conn()?;
        let purged = conn
            .execute(
                "DELETE FROM pairing_tickets WHERE state != 'issued' AND expires_at <= ?1",
                [now],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(purged)
    }

    /// All tickets, newest first.
    pub fn list_tickets(&self) -> Result<Vec<TicketSummary>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT ticket_id, profile_scope, issued_at, expires_at, state, device_id
                 FROM pairing_tickets ORDER BY issued_at DESC",
            )
            .map_err(DatabaseError::Sqlite)?;
        let tickets = stmt
            .query_map([], |row| {
                let ticket_id: String = row.get(0)?;
                let state: String = row.get(4)?;
                let device_id: Option<String> = row.get(5)?;
                Ok(TicketSummary {
                    ticket_id: Uuid::parse_str(&ticket_id)
                        .map_err(|e| corrupt_column(0, e.to_string()))?,
                    profile_scope: row.get(1)?,
                    issued_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    state: TicketState::parse(&state)
                        .ok_or_else(|| corrupt_column(4, format!("unknown ticket state: {}", state)))?,
                    device_id: device_id.and_then(|d| Uuid::parse_str(&d).ok()),
                })
            })
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(tickets)
    }
}

/// Companion side of one pairing attempt.
///
/// Holds the companion's key pair between building the request and opening
/// the sealed token in the response.
pub struct PairingAttempt {
    payload: BootstrapPayload,
    keys: KeyExchangePair,
}

impl PairingAttempt {
    pub fn new(payload: BootstrapPayload) -> Self {
        Self {
            payload,
            keys: KeyExchangePair::generate(),
        }
    }

    pub fn payload(&self) -> &BootstrapPayload {
        &self.payload
    }

    /// Request body for the redemption endpoint.
    pub fn request(&self, display_name: &str) -> RedeemRequest {
        RedeemRequest {
            ticket: self.payload.ticket.clone(),
            companion_public_key: encode_b64url(&self.keys.public_key_bytes()),
            display_name: display_name.to_string(),
        }
    }

    /// Derive the session-establishment key and open the sealed bearer.
    pub fn complete(&self, response: &RedeemResponse) -> Result<String> {
        let desktop_public = self.payload.desktop_public_key_bytes()?;
        let ticket = Zeroizing::new(self.payload.ticket_bytes()?);
        let session_key = self
            .keys
            .derive_session_key(&desktop_public, &ticket)
            .map_err(|e| PairingError::KeyExchangeFailed(e.to_string()))?;

        let sealed = decode_b64url(&response.sealed_token)?;
        let bearer = crypto::open(&session_key, &sealed).map_err(|_| {
            PairingError::KeyExchangeFailed("sealed token could not be opened".to_string())
        })?;
        String::from_utf8(bearer)
            .map_err(|_| PairingError::KeyExchangeFailed("sealed token is not UTF-8".to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionPolicy;
    use crate::device::{DeviceRegistry, PairingState};
    use crate::session::TokenError;

    struct Setup {
        db: Database,
        clock: ManualClock,
        sessions: SessionTokenManager,
        pairing: PairingCoordinator,
    }

    fn setup() -> Setup {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        let clock = ManualClock::new(0);
        let sessions =
            SessionTokenManager::new(db.clone(), SessionPolicy::default(), clock.shared()).unwrap();
        let pairing = PairingCoordinator::new(
            db.clone(),
            PairingPolicy::default(),
            sessions.clone(),
            clock.shared(),
        );
        Setup {
            db,
            clock,
            sessions,
            pairing,
        }
    }

    fn anchor() -> TrustAnchor {
        TrustAnchor {
            ca_fingerprint: "aa".repeat(32),
            leaf_fingerprint: "bb".repeat(32),
            bootstrap_url: "http://192.168.1.20:7420".to_string(),
            service_url: "https://192.168.1.20:7421".to_string(),
        }
    }

    #[test]
    fn error_codes_roundtrip() {
        for e in [
            PairingError::TicketExpired,
            PairingError::TicketAlreadyConsumed,
            PairingError::TicketNotFound,
            PairingError::KeyExchangeFailed("low order point".to_string()),
            PairingError::TooManyOutstandingTickets { limit: 5 },
            PairingError::InvalidPayload("bad version".to_string()),
        ] {
            let message = match &e {
                PairingError::KeyExchangeFailed(m) | PairingError::InvalidPayload(m) => m.clone(),
                other => other.to_string(),
            };
            assert_eq!(PairingError::from_code(e.code(), &message), Some(e));
        }
        assert_eq!(PairingError::from_code("rate_limited", ""), None);
    }

    fn pairing_err(result: Result<impl std::fmt::Debug>) -> PairingError {
        match result {
            Err(PairSyncError::Pairing(e)) => e,
            other => panic!("expected pairing error, got {:?}", other),
        }
    }

    fn redeem(s: &Setup, attempt: &PairingAttempt) -> Result<Redemption> {
        let request = attempt.request("Phone");
        let public = decode_b64url(&request.companion_public_key).unwrap();
        s.pairing.redeem_ticket(&request.ticket, &public, "Phone")
    }

    #[test]
    fn redeem_within_ttl_issues_token() {
        // T1 issued at t=0, redeemed at t=10.
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        assert_eq!(issued.payload.expires_at, 30);

        s.clock.set(10);
        let attempt = PairingAttempt::new(issued.payload.clone());
        let redemption = redeem(&s, &attempt).unwrap();
        assert_eq!(redemption.token_expires_at, 310);
        assert_eq!(redemption.profile_scope, "personal");

        let bearer = attempt.complete(&redemption.to_response()).unwrap();
        let identity = s.sessions.authenticate(&bearer).unwrap();
        assert_eq!(identity.device_id, redemption.device_id);

        let device = DeviceRegistry::new(s.db.clone())
            .get(&redemption.device_id)
            .unwrap()
            .unwrap();
        assert_eq!(device.pairing_state, PairingState::Paired);

        let tickets = s.pairing.list_tickets().unwrap();
        assert_eq!(tickets[0].state, TicketState::Redeemed);
        assert_eq!(tickets[0].device_id, Some(redemption.device_id));
    }

    #[test]
    fn redeem_after_ttl_is_expired() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();

        s.clock.set(35);
        let attempt = PairingAttempt::new(issued.payload);
        assert_eq!(pairing_err(redeem(&s, &attempt)), PairingError::TicketExpired);

        s.clock.set(30);
        assert_eq!(pairing_err(redeem(&s, &attempt)), PairingError::TicketExpired);
    }

    #[test]
    fn second_redemption_is_consumed() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        let attempt = PairingAttempt::new(issued.payload.clone());
        redeem(&s, &attempt).unwrap();

        let replay = PairingAttempt::new(issued.payload);
        assert_eq!(
            pairing_err(redeem(&s, &replay)),
            PairingError::TicketAlreadyConsumed
        );
        assert_eq!(DeviceRegistry::new(s.db.clone()).list().unwrap().len(), 1);
    }

    #[test]
    fn concurrent_redemption_has_one_winner() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pairing = s.pairing.clone();
                let payload = issued.payload.clone();
                std::thread::spawn(move || {
                    let attempt = PairingAttempt::new(payload);
                    let request = attempt.request("Phone");
                    let public = decode_b64url(&request.companion_public_key).unwrap();
                    pairing.redeem_ticket(&request.ticket, &public, "Phone")
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.into_iter().filter(|r| r.is_err()) {
            assert_eq!(pairing_err(result), PairingError::TicketAlreadyConsumed);
        }
        assert_eq!(DeviceRegistry::new(s.db.clone()).list().unwrap().len(), 1);
    }

    #[test]
    fn unknown_ticket_is_not_found() {
        let s = setup();
        let ticket = encode_b64url(&[9u8; 32]);
        let public = KeyExchangePair::generate().public_key_bytes();
        assert_eq!(
            pairing_err(s.pairing.redeem_ticket(&ticket, &public, "Phone")),
            PairingError::TicketNotFound
        );
        assert_eq!(
            pairing_err(s.pairing.redeem_ticket("***", &public, "Phone")),
            PairingError::TicketNotFound
        );
    }

    #[test]
    fn key_exchange_failure_leaves_ticket_issued() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();

        let err = pairing_err(s.pairing.redeem_ticket(&issued.payload.ticket, &[0u8; 32], "Phone"));
        assert!(matches!(err, PairingError::KeyExchangeFailed(_)));
        assert_eq!(s.pairing.list_tickets().unwrap()[0].state, TicketState::Issued);
        assert!(DeviceRegistry::new(s.db.clone()).list().unwrap().is_empty());

        // The ticket is still redeemable by the legitimate companion.
        let attempt = PairingAttempt::new(issued.payload);
        assert!(redeem(&s, &attempt).is_ok());
    }

    #[test]
    fn cancelled_ticket_is_expired() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        assert!(s.pairing.cancel_ticket(&issued.ticket_id).unwrap());
        assert!(!s.pairing.cancel_ticket(&issued.ticket_id).unwrap());

        let attempt = PairingAttempt::new(issued.payload);
        assert_eq!(pairing_err(redeem(&s, &attempt)), PairingError::TicketExpired);
    }

    #[test]
    fn outstanding_ticket_limit() {
        let s = setup();
        for _ in 0..PairingPolicy::default().max_outstanding_tickets {
            s.pairing.issue_ticket("personal", &anchor()).unwrap();
        }
        assert_eq!(
            pairing_err(s.pairing.issue_ticket("personal", &anchor())),
            PairingError::TooManyOutstandingTickets { limit: 5 }
        );

        // Expired tickets no longer count.
        s.clock.set(30);
        assert!(s.pairing.issue_ticket("personal", &anchor()).is_ok());
    }

    #[test]
    fn expire_and_purge() {
        let s = setup();
        let open = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        let used = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        redeem(&s, &PairingAttempt::new(used.payload)).unwrap();

        // Within the TTL nothing is collected.
        assert_eq!(s.pairing.expire_tickets().unwrap(), 0);
        assert_eq!(s.pairing.purge_tickets().unwrap(), 0);

        s.clock.set(31);
        assert_eq!(s.pairing.expire_tickets().unwrap(), 1);
        let secret: Option<Vec<u8>> = s
            .db
            .conn()
            .unwrap()
            .query_row(
                "SELECT desktop_secret FROM pairing_tickets WHERE ticket_id = ?1",
                [open.ticket_id.to_string()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(secret.is_none());

        assert_eq!(s.pairing.purge_tickets().unwrap(), 2);
        assert!(s.pairing.list_tickets().unwrap().is_empty());
    }

    #[test]
    fn only_the_companion_can_open_the_token() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        let attempt = PairingAttempt::new(issued.payload.clone());
        let redemption = redeem(&s, &attempt).unwrap();

        let eavesdropper = PairingAttempt::new(issued.payload);
        let err = eavesdropper.complete(&redemption.to_response()).unwrap_err();
        assert!(matches!(
            err,
            PairSyncError::Pairing(PairingError::KeyExchangeFailed(_))
        ));
    }

    #[test]
    fn revoked_device_token_fails() {
        let s = setup();
        let issued = s.pairing.issue_ticket("personal", &anchor()).unwrap();
        let attempt = PairingAttempt::new(issued.payload);
        let redemption = redeem(&s, &attempt).unwrap();
        let bearer = attempt.complete(&redemption.to_response()).unwrap();

        s.sessions.revoke(&redemption.device_id).unwrap();
        assert!(matches!(
            s.sessions.authenticate(&bearer),
            Err(PairSyncError::Token(TokenError::TokenRevoked))
        ));
    }

    #[test]
    fn empty_profile_is_rejected() {
        let s = setup();
        assert!(matches!(
            s.pairing.issue_ticket("  ", &anchor()),
            Err(PairSyncError::InvalidInput(_))
        ));
    }
}
