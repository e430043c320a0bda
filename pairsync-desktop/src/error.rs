//! Daemon error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pairsync_core::{CertificateError, PairSyncError, PairingError, SyncError, TokenError};

/// Errors returned by handlers, mapped to HTTP status codes.
///
/// Bodies always carry a stable `error` code; companions rebuild the core
/// error from it.
#[derive(Debug)]
pub enum DesktopError {
    Core(PairSyncError),
    /// No usable bearer on the request.
    MissingCredentials,
    /// The bearer belongs to a revoked device. `wipe` is set while the
    /// device still owes a cache wipe.
    Revoked { wipe: bool },
    Forbidden(String),
    RateLimited,
    BadRequest(String),
}

impl std::fmt::Display for DesktopError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Core(e) => write!(f, "{}", e),
            Self::MissingCredentials => write!(f, "Missing bearer token"),
            Self::Revoked { .. } => write!(f, "{}", TokenError::TokenRevoked),
            Self::Forbidden(e) => write!(f, "Forbidden: {}", e),
            Self::RateLimited => write!(f, "Rate limited"),
            Self::BadRequest(e) => write!(f, "Bad request: {}", e),
        }
    }
}

impl std::error::Error for DesktopError {}

impl From<PairSyncError> for DesktopError {
    fn from(e: PairSyncError) -> Self {
        Self::Core(e)
    }
}

fn pairing_status(e: &PairingError) -> StatusCode {
    match e {
        PairingError::TicketExpired => StatusCode::GONE,
        PairingError::TicketAlreadyConsumed => StatusCode::CONFLICT,
        PairingError::TicketNotFound => StatusCode::NOT_FOUND,
        PairingError::KeyExchangeFailed(_) | PairingError::InvalidPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        PairingError::TooManyOutstandingTickets { .. } => StatusCode::TOO_MANY_REQUESTS,
    }
}

impl IntoResponse for DesktopError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "message": self.to_string() });

        let (status, code) = match &self {
            Self::Core(PairSyncError::Token(e)) => {
                body["wipe"] = serde_json::json!(*e == TokenError::TokenRevoked);
                (StatusCode::UNAUTHORIZED, e.code())
            }
            Self::Core(PairSyncError::Pairing(e)) => (pairing_status(e), e.code()),
            Self::Core(PairSyncError::Sync(e)) => {
                let status = match e {
                    SyncError::VersionGap {
                        profile_scope,
                        since_version,
                        retained_floor,
                    } => {
                        body["profile_scope"] = serde_json::json!(profile_scope);
                        body["since_version"] = serde_json::json!(since_version);
                        body["retained_floor"] = serde_json::json!(retained_floor);
                        StatusCode::CONFLICT
                    }
                    SyncError::TransportInterrupted(_) => StatusCode::SERVICE_UNAVAILABLE,
                    SyncError::ApplyIntegrityViolation(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.code())
            }
            Self::Core(PairSyncError::InvalidInput(_)) | Self::Core(PairSyncError::Crypto(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_input")
            }
            Self::Core(PairSyncError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Self::Core(PairSyncError::Certificate(CertificateError::FingerprintMismatch {
                ..
            })) => (StatusCode::INTERNAL_SERVER_ERROR, "fingerprint_mismatch"),
            Self::Core(e) => {
                tracing::error!("Internal error: {}", e);
                body["message"] = serde_json::json!("Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
            Self::MissingCredentials => (StatusCode::UNAUTHORIZED, "token_invalid_signature"),
            Self::Revoked { wipe } => {
                body["wipe"] = serde_json::json!(*wipe);
                (StatusCode::UNAUTHORIZED, TokenError::TokenRevoked.code())
            }
            Self::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            Self::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        };

        body["error"] = serde_json::json!(code);
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_of(e: DesktopError) -> (StatusCode, serde_json::Value) {
        let resp = e.into_response();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn revoked_token_asks_for_wipe() {
        let (status, body) = body_of(PairSyncError::from(TokenError::TokenRevoked).into()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "token_revoked");
        assert_eq!(body["wipe"], true);

        let (_, body) = body_of(PairSyncError::from(TokenError::TokenExpired).into()).await;
        assert_eq!(body["wipe"], false);

        let (status, body) = body_of(DesktopError::Revoked { wipe: false }).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "token_revoked");
        assert_eq!(body["wipe"], false);
    }

    #[tokio::test]
    async fn version_gap_carries_floor() {
        let gap = SyncError::VersionGap {
            profile_scope: "personal".to_string(),
            since_version: 2,
            retained_floor: 7,
        };
        let (status, body) = body_of(PairSyncError::from(gap).into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "version_gap");
        assert_eq!(body["retained_floor"], 7);
    }

    #[tokio::test]
    async fn consumed_ticket_is_conflict() {
        let (status, body) =
            body_of(PairSyncError::from(PairingError::TicketAlreadyConsumed).into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "ticket_already_consumed");
    }
}
