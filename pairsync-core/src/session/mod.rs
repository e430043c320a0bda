//! Session token manager.
//!
//! Each paired device holds a chain of session tokens:
//!
//! ```text
//! Active --rotate--> Grace --(grace window)--> expired
//!    \                 \
//!     `---- revoke -----`--> Revoked
//! ```
//!
//! A rotation mints a new `Active` token and leaves the presented one usable
//! in `Grace` for a fixed window so in-flight requests are not rejected.
//! Revocation skips the grace window and is the only path that also tells
//! the sync engine to wipe the device's cache.

pub mod token;

pub use token::BearerSigner;

use std::sync::{Arc, RwLock};

use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLogger};
use crate::clock::SharedClock;
use crate::config::SessionPolicy;
use crate::device::{corrupt_column, load_device, mark_revoked, PairingState};
use crate::{Database, DatabaseError, PairSyncError, Result};

/// Session credential failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Session token expired")]
    TokenExpired,

    #[error("Session token revoked")]
    TokenRevoked,

    #[error("Session token signature invalid")]
    TokenInvalidSignature,

    #[error("Session token already rotated")]
    TokenSuperseded,
}

impl TokenError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TokenError::TokenExpired => "token_expired",
            TokenError::TokenRevoked => "token_revoked",
            TokenError::TokenInvalidSignature => "token_invalid_signature",
            TokenError::TokenSuperseded => "token_superseded",
        }
    }

    /// Inverse of [`TokenError::code`].
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "token_expired" => Some(TokenError::TokenExpired),
            "token_revoked" => Some(TokenError::TokenRevoked),
            "token_invalid_signature" => Some(TokenError::TokenInvalidSignature),
            "token_superseded" => Some(TokenError::TokenSuperseded),
            _ => None,
        }
    }
}

/// Token lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Active,
    Grace,
    Revoked,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Active => "active",
            TokenState::Grace => "grace",
            TokenState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TokenState::Active),
            "grace" => Some(TokenState::Grace),
            "revoked" => Some(TokenState::Revoked),
            _ => None,
        }
    }
}

/// Stored token record. The bearer string itself is never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub token_id: Uuid,
    pub device_id: Uuid,
    pub issued_at: i64,
    pub expires_at: i64,
    pub predecessor_token_id: Option<Uuid>,
    pub state: TokenState,
    pub state_changed_at: i64,
}

/// A freshly minted token together with its bearer string.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub bearer: String,
    pub token: SessionToken,
}

/// Body returned by the rotate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateResponse {
    pub bearer: String,
    pub token_id: Uuid,
    pub expires_at: i64,
}

impl From<&IssuedToken> for RotateResponse {
    fn from(issued: &IssuedToken) -> Self {
        Self {
            bearer: issued.bearer.clone(),
            token_id: issued.token.token_id,
            expires_at: issued.token.expires_at,
        }
    }
}

/// Identity established by a successful [`SessionTokenManager::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticated {
    pub device_id: Uuid,
    pub token_id: Uuid,
    pub token_state: TokenState,
    pub profile_scope: String,
    pub expires_at: i64,
}

/// Notified after a device has been revoked.
pub trait RevocationObserver: Send + Sync {
    fn on_revoked(&self, device_id: &Uuid);
}

const TOKEN_COLUMNS: &str =
    "token_id, device_id, issued_at, expires_at, predecessor_token_id, state, state_changed_at";

fn row_to_token(row: &Row<'_>) -> rusqlite::Result<SessionToken> {
    let token_id: String = row.get(0)?;
    let device_id: String = row.get(1)?;
    let predecessor: Option<String> = row.get(4)?;
    let state: String = row.get(5)?;

    Ok(SessionToken {
        token_id: Uuid::parse_str(&token_id).map_err(|e| corrupt_column(0, e.to_string()))?,
        device_id: Uuid::parse_str(&device_id).map_err(|e| corrupt_column(1, e.to_string()))?,
        issued_at: row.get(2)?,
        expires_at: row.get(3)?,
        predecessor_token_id: predecessor
            .map(|p| Uuid::parse_str(&p).map_err(|e| corrupt_column(4, e.to_string())))
            .transpose()?,
        state: TokenState::parse(&state)
            .ok_or_else(|| corrupt_column(5, format!("unknown token state: {}", state)))?,
        state_changed_at: row.get(6)?,
    })
}

fn load_token(conn: &Connection, token_id: &Uuid) -> Result<Option<SessionToken>> {
    let token = conn
        .query_row(
            &format!("SELECT {} FROM session_tokens WHERE token_id = ?1", TOKEN_COLUMNS),
            [token_id.to_string()],
            row_to_token,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;
    Ok(token)
}

/// Issues, rotates, authenticates and revokes session tokens.
#[derive(Clone)]
pub struct SessionTokenManager {
    db: Database,
    clock: SharedClock,
    policy: SessionPolicy,
    signer: BearerSigner,
    observers: Arc<RwLock<Vec<Arc<dyn RevocationObserver>>>>,
    audit: AuditLogger,
}

impl SessionTokenManager {
    /// Build a manager over an initialized desktop database.
    pub fn new(db: Database, policy: SessionPolicy, clock: SharedClock) -> Result<Self> {
        let key = db.token_signing_key()?;
        let signer = BearerSigner::new(&key)?;
        Ok(Self {
            db,
            clock,
            policy,
            signer,
            observers: Arc::new(RwLock::new(Vec::new())),
            audit: AuditLogger::disabled(),
        })
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    /// Register a party to be told about revocations.
    pub fn add_observer(&self, observer: Arc<dyn RevocationObserver>) {
        if let Ok(mut observers) = self.observers.write() {
            observers.push(observer);
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    /// Insert a new `Active` token on the caller's connection.
    pub(crate) fn mint_in(
        &self,
        conn: &Connection,
        device_id: &Uuid,
        predecessor: Option<Uuid>,
        now: i64,
    ) -> Result<IssuedToken> {
        let token = SessionToken {
            token_id: Uuid::new_v4(),
            device_id: *device_id,
            issued_at: now,
            expires_at: now + self.policy.token_lifetime_secs,
            predecessor_token_id: predecessor,
            state: TokenState::Active,
            state_changed_at: now,
        };

        conn.execute(
            &format!(
                "INSERT INTO session_tokens ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                TOKEN_COLUMNS
            ),
            rusqlite::params![
                token.token_id.to_string(),
                token.device_id.to_string(),
                token.issued_at,
                token.expires_at,
                token.predecessor_token_id.map(|p| p.to_string()),
                token.state.as_str(),
                token.state_changed_at,
            ],
        )
        .map_err(DatabaseError::Sqlite)?;

        Ok(IssuedToken {
            bearer: self.signer.sign(&token.token_id),
            token,
        })
    }

    /// Admit a request carrying `bearer`.
    ///
    /// Succeeds for an `Active` token or a `Grace` token inside its window.
    /// The first successful authentication of a `Pending` device completes
    /// its pairing.
    pub fn authenticate(&self, bearer: &str) -> Result<Authenticated> {
        let token_id = self.signer.verify(bearer).map_err(|e| {
            warn!("Rejected bearer with invalid signature");
            e
        })?;
        let now = self.clock.now();
        let conn = self.db.conn()?;

        // A validly signed token with no record was garbage-collected after
        // it expired.
        let token = load_token(&conn, &token_id)?.ok_or(TokenError::TokenExpired)?;

        if token.state == TokenState::Revoked {
            return Err(self.reject(TokenError::TokenRevoked, &token.device_id));
        }
        if now >= token.expires_at {
            return Err(self.reject(TokenError::TokenExpired, &token.device_id));
        }

        let device = match load_device(&conn, &token.device_id)? {
            Some(device) if !device.is_revoked() => device,
            _ => return Err(self.reject(TokenError::TokenRevoked, &token.device_id)),
        };

        conn.execute(
            "UPDATE devices SET pairing_state = 'paired', last_seen_at = ?2
             WHERE device_id = ?1 AND pairing_state != 'revoked'",
            rusqlite::params![device.device_id.to_string(), now],
        )
        .map_err(DatabaseError::Sqlite)?;
        if device.pairing_state == PairingState::Pending {
            info!("Device {} completed pairing", device.device_id);
        }

        Ok(Authenticated {
            device_id: device.device_id,
            token_id: token.token_id,
            token_state: token.state,
            profile_scope: device.profile_scope,
            expires_at: token.expires_at,
        })
    }

    fn reject(&self, error: TokenError, device_id: &Uuid) -> PairSyncError {
        warn!("Rejected token for device {}: {}", device_id, error);
        if error == TokenError::TokenRevoked {
            self.audit.record(
                AuditEventType::AuthenticationRejected {
                    reason: error.code().to_string(),
                },
                &device_id.to_string(),
            );
        }
        error.into()
    }

    /// Exchange an `Active` token for a new one.
    ///
    /// The presented token moves to `Grace` and keeps working until
    /// `now + grace_secs`. Any older `Grace` token of the same device is
    /// revoked so at most one predecessor is live.
    pub fn rotate(&self, bearer: &str) -> Result<IssuedToken> {
        let token_id = self.signer.verify(bearer)?;
        let now = self.clock.now();

        let mut conn = self.db.conn()?;
        let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

        let token = load_token(&tx, &token_id)?.ok_or(TokenError::TokenExpired)?;
        match token.state {
            TokenState::Revoked => return Err(TokenError::TokenRevoked.into()),
            TokenState::Grace => return Err(TokenError::TokenSuperseded.into()),
            TokenState::Active if now >= token.expires_at => {
                return Err(TokenError::TokenExpired.into())
            }
            TokenState::Active => {}
        }
        match load_device(&tx, &token.device_id)? {
            Some(device) if !device.is_revoked() => {}
            _ => return Err(TokenError::TokenRevoked.into()),
        }

        let changed = tx
            .execute(
                "UPDATE session_tokens SET state = 'grace', expires_at = ?2, state_changed_at = ?3
                 WHERE token_id = ?1 AND state = 'active'",
                rusqlite::params![token_id.to_string(), now + self.policy.grace_secs, now],
            )
            .map_err(DatabaseError::Sqlite)?;
        if changed == 0 {
            return Err(TokenError::TokenSuperseded.into());
        }

        tx.execute(
            "UPDATE session_tokens SET state = 'revoked', state_changed_at = ?3
             WHERE device_id = ?1 AND state = 'grace' AND token_id != ?2",
            rusqlite::params![token.device_id.to_string(), token_id.to_string(), now],
        )
        .map_err(DatabaseError::Sqlite)?;

        let issued = self.mint_in(&tx, &token.device_id, Some(token_id), now)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!("Rotated session token for device {}", token.device_id);
        self.audit.record(
            AuditEventType::TokenRotated {
                device_id: token.device_id.to_string(),
            },
            "",
        );
        Ok(issued)
    }

    /// Revoke a device and every token it holds, then notify observers.
    ///
    /// Returns the number of tokens that were still live.
    pub fn revoke(&self, device_id: &Uuid) -> Result<usize> {
        let now = self.clock.now();
        let revoked = {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction().map_err(DatabaseError::Sqlite)?;

            if !mark_revoked(&tx, device_id, now)? {
                return Err(PairSyncError::NotFound(format!("device {}", device_id)));
            }
            let revoked = tx
                .execute(
                    "UPDATE session_tokens SET state = 'revoked', state_changed_at = ?2
                     WHERE device_id = ?1 AND state != 'revoked'",
                    rusqlite::params![device_id.to_string(), now],
                )
                .map_err(DatabaseError::Sqlite)?;
            tx.commit().map_err(DatabaseError::Sqlite)?;
            revoked
        };

        info!("Revoked device {} ({} live tokens)", device_id, revoked);
        self.audit.record(
            AuditEventType::DeviceRevoked {
                device_id: device_id.to_string(),
            },
            &format!("tokens={}", revoked),
        );

        let observers = self
            .observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default();
        for observer in observers {
            observer.on_revoked(device_id);
        }

        Ok(revoked)
    }

    /// Self-service unpair: the presenting device revokes itself.
    pub fn unpair(&self, bearer: &str) -> Result<Uuid> {
        let identity = self.authenticate(bearer)?;
        self.revoke(&identity.device_id)?;
        Ok(identity.device_id)
    }

    /// The revoked device a validly signed bearer belongs to, if any.
    pub fn revoked_device(&self, bearer: &str) -> Result<Option<Uuid>> {
        let token_id = self.signer.verify(bearer)?;
        let conn = self.db.conn()?;
        let Some(token) = load_token(&conn, &token_id)? else {
            return Ok(None);
        };
        Ok(load_device(&conn, &token.device_id)?
            .filter(|device| device.is_revoked())
            .map(|device| device.device_id))
    }

    /// Delete token records past their expiry. Returns how many were removed.
    pub fn prune(&self) -> Result<usize> {
        let now = self.clock.now();
        let conn = self.db.conn()?;
        let removed = conn
            .execute("DELETE FROM session_tokens WHERE expires_at <= ?1", [now])
            .map_err(DatabaseError::Sqlite)?;
        if removed > 0 {
            info!("Pruned {} expired session tokens", removed);
        }
        Ok(removed)
    }

    /// Token records for one device, oldest first.
    pub fn list_tokens(&self, device_id: &Uuid) -> Result<Vec<SessionToken>> {
        let conn = self.db.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM session_tokens WHERE device_id = ?1 ORDER BY issued_at, rowid",
                TOKEN_COLUMNS
            ))
            .map_err(DatabaseError::Sqlite)?;
        let tokens = stmt
            .query_map([device_id.to_string()], row_to_token)
            .map_err(DatabaseError::Sqlite)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(DatabaseError::Sqlite)?;
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::device::{insert_device, Device, DeviceRegistry};
    use std::sync::Mutex;

    struct Setup {
        db: Database,
        clock: ManualClock,
        manager: SessionTokenManager,
        device: Device,
    }

    fn setup() -> Setup {
        let db = Database::in_memory().unwrap();
        db.initialize_desktop_schema().unwrap();
        let clock = ManualClock::new(0);
        let manager =
            SessionTokenManager::new(db.clone(), SessionPolicy::default(), clock.shared()).unwrap();
        let device = Device::new_companion("Phone", vec![3u8; 32], "personal", 0);
        insert_device(&db.conn().unwrap(), &device).unwrap();
        Setup {
            db,
            clock,
            manager,
            device,
        }
    }

    fn mint(s: &Setup) -> IssuedToken {
        let conn = s.db.conn().unwrap();
        s.manager
            .mint_in(&conn, &s.device.device_id, None, s.clock.now())
            .unwrap()
    }

    fn token_err(result: Result<impl std::fmt::Debug>) -> TokenError {
        match result {
            Err(PairSyncError::Token(e)) => e,
            other => panic!("expected token error, got {:?}", other),
        }
    }

    #[test]
    fn active_token_authenticates_and_completes_pairing() {
        let s = setup();
        let issued = mint(&s);

        let identity = s.manager.authenticate(&issued.bearer).unwrap();
        assert_eq!(identity.device_id, s.device.device_id);
        assert_eq!(identity.profile_scope, "personal");
        assert_eq!(identity.token_state, TokenState::Active);

        let device = DeviceRegistry::new(s.db.clone())
            .get(&s.device.device_id)
            .unwrap()
            .unwrap();
        assert_eq!(device.pairing_state, PairingState::Paired);
        assert_eq!(device.last_seen_at, Some(0));
    }

    #[test]
    fn token_expires_at_lifetime() {
        let s = setup();
        let issued = mint(&s);
        s.clock.set(299);
        assert!(s.manager.authenticate(&issued.bearer).is_ok());
        s.clock.set(300);
        assert_eq!(
            token_err(s.manager.authenticate(&issued.bearer)),
            TokenError::TokenExpired
        );
    }

    #[test]
    fn rotation_grace_window() {
        // A1 issued at t=10, rotated at t=290 into A2.
        let s = setup();
        s.clock.set(10);
        let a1 = mint(&s);
        assert_eq!(a1.token.expires_at, 310);

        s.clock.set(290);
        let a2 = s.manager.rotate(&a1.bearer).unwrap();
        assert_eq!(a2.token.predecessor_token_id, Some(a1.token.token_id));
        assert_eq!(a2.token.expires_at, 590);

        s.clock.set(305);
        let identity = s.manager.authenticate(&a1.bearer).unwrap();
        assert_eq!(identity.token_state, TokenState::Grace);
        assert!(s.manager.authenticate(&a2.bearer).is_ok());

        s.clock.set(325);
        assert_eq!(
            token_err(s.manager.authenticate(&a1.bearer)),
            TokenError::TokenExpired
        );
        assert!(s.manager.authenticate(&a2.bearer).is_ok());
    }

    #[test]
    fn grace_token_cannot_rotate_again() {
        let s = setup();
        let a1 = mint(&s);
        s.manager.rotate(&a1.bearer).unwrap();
        assert_eq!(
            token_err(s.manager.rotate(&a1.bearer)),
            TokenError::TokenSuperseded
        );
    }

    #[test]
    fn only_one_grace_token_survives() {
        let s = setup();
        let a1 = mint(&s);
        s.clock.advance(10);
        let a2 = s.manager.rotate(&a1.bearer).unwrap();
        s.clock.advance(10);
        let a3 = s.manager.rotate(&a2.bearer).unwrap();

        assert_eq!(
            token_err(s.manager.authenticate(&a1.bearer)),
            TokenError::TokenRevoked
        );
        assert!(s.manager.authenticate(&a2.bearer).is_ok());
        assert!(s.manager.authenticate(&a3.bearer).is_ok());

        let states: Vec<TokenState> = s
            .manager
            .list_tokens(&s.device.device_id)
            .unwrap()
            .iter()
            .map(|t| t.state)
            .collect();
        assert_eq!(
            states,
            vec![TokenState::Revoked, TokenState::Grace, TokenState::Active]
        );
    }

    #[test]
    fn expired_token_cannot_rotate() {
        let s = setup();
        let a1 = mint(&s);
        s.clock.set(400);
        assert_eq!(
            token_err(s.manager.rotate(&a1.bearer)),
            TokenError::TokenExpired
        );
    }

    #[test]
    fn revoke_invalidates_every_token_and_notifies() {
        struct Recorder(Mutex<Vec<Uuid>>);
        impl RevocationObserver for Recorder {
            fn on_revoked(&self, device_id: &Uuid) {
                self.0.lock().unwrap().push(*device_id);
            }
        }

        let s = setup();
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        s.manager.add_observer(recorder.clone());

        let a1 = mint(&s);
        let a2 = s.manager.rotate(&a1.bearer).unwrap();

        assert_eq!(s.manager.revoke(&s.device.device_id).unwrap(), 2);

        for bearer in [&a1.bearer, &a2.bearer] {
            assert_eq!(
                token_err(s.manager.authenticate(bearer)),
                TokenError::TokenRevoked
            );
        }
        assert_eq!(*recorder.0.lock().unwrap(), vec![s.device.device_id]);

        let device = DeviceRegistry::new(s.db.clone())
            .get(&s.device.device_id)
            .unwrap()
            .unwrap();
        assert!(device.is_revoked());
        assert!(device.wipe_pending);
    }

    #[test]
    fn revoke_unknown_device_is_not_found() {
        let s = setup();
        assert!(matches!(
            s.manager.revoke(&Uuid::new_v4()),
            Err(PairSyncError::NotFound(_))
        ));
    }

    #[test]
    fn unpair_revokes_self() {
        let s = setup();
        let a1 = mint(&s);
        assert_eq!(s.manager.revoked_device(&a1.bearer).unwrap(), None);
        assert_eq!(s.manager.unpair(&a1.bearer).unwrap(), s.device.device_id);
        assert_eq!(
            s.manager.revoked_device(&a1.bearer).unwrap(),
            Some(s.device.device_id)
        );
        assert_eq!(
            token_err(s.manager.authenticate(&a1.bearer)),
            TokenError::TokenRevoked
        );
    }

    #[test]
    fn forged_bearer_is_invalid_signature() {
        let s = setup();
        let a1 = mint(&s);
        let forged = format!("{}x", a1.bearer);
        assert_eq!(
            token_err(s.manager.authenticate(&forged)),
            TokenError::TokenInvalidSignature
        );
    }

    #[test]
    fn pruned_token_reads_as_expired() {
        let s = setup();
        let a1 = mint(&s);
        s.clock.set(1000);
        assert_eq!(s.manager.prune().unwrap(), 1);
        assert!(s.manager.list_tokens(&s.device.device_id).unwrap().is_empty());
        assert_eq!(
            token_err(s.manager.authenticate(&a1.bearer)),
            TokenError::TokenExpired
        );
    }

    #[test]
    fn error_codes_roundtrip() {
        for e in [
            TokenError::TokenExpired,
            TokenError::TokenRevoked,
            TokenError::TokenInvalidSignature,
            TokenError::TokenSuperseded,
        ] {
            assert_eq!(TokenError::from_code(e.code()), Some(e));
        }
    }
}
