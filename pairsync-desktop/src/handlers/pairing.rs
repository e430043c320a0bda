//! Pairing ticket handlers.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Path, State};
use axum::Json;
use pairsync_core::crypto::decode_b64url;
use pairsync_core::pairing::{RedeemRequest, RedeemResponse, TicketSummary};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DesktopError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct IssueTicketRequest {
    pub profile_scope: String,
}

#[derive(Serialize, Deserialize)]
pub struct IssueTicketResponse {
    pub ticket_id: Uuid,
    /// Bootstrap payload to render as a QR code.
    pub uri: String,
    pub expires_at: i64,
}

/// Redeem a ticket. Rate limited per client address.
pub async fn redeem(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RedeemRequest>,
) -> Result<Json<RedeemResponse>, DesktopError> {
    if !state.redeem_limiter.check(&peer.ip().to_string()) {
        tracing::warn!("Redemption rate limit hit by {}", peer.ip());
        return Err(DesktopError::RateLimited);
    }

    let companion_public_key = decode_b64url(&req.companion_public_key)
        .map_err(|e| DesktopError::BadRequest(format!("companion_public_key: {}", e)))?;
    let display_name = req.display_name.trim();
    if display_name.is_empty() {
        return Err(DesktopError::BadRequest("display_name is empty".to_string()));
    }

    let redemption = state
        .pairing
        .redeem_ticket(&req.ticket, &companion_public_key, display_name)?;
    Ok(Json(redemption.to_response()))
}

/// Issue a ticket for a profile. Loopback only.
pub async fn issue_ticket(
    State(state): State<AppState>,
    Json(req): Json<IssueTicketRequest>,
) -> Result<Json<IssueTicketResponse>, DesktopError> {
    let issued = state
        .pairing
        .issue_ticket(&req.profile_scope, &state.trust_anchor())?;
    Ok(Json(IssueTicketResponse {
        ticket_id: issued.ticket_id,
        uri: issued.payload.to_uri().map_err(pairsync_core::PairSyncError::from)?,
        expires_at: issued.payload.expires_at,
    }))
}

pub async fn list_tickets(
    State(state): State<AppState>,
) -> Result<Json<Vec<TicketSummary>>, DesktopError> {
    Ok(Json(state.pairing.list_tickets()?))
}

pub async fn cancel_ticket(
    State(state): State<AppState>,
    Path(ticket_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, DesktopError> {
    if !state.pairing.cancel_ticket(&ticket_id)? {
        return Err(pairsync_core::PairSyncError::from(
            pairsync_core::PairingError::TicketNotFound,
        )
        .into());
    }
    Ok(Json(serde_json::json!({
        "ticket_id": ticket_id,
        "status": "cancelled",
    })))
}
