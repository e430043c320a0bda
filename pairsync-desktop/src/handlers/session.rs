//! Session endpoints for paired companions.

use axum::extract::State;
use axum::http::Extensions;
use axum::Json;
use pairsync_core::session::RotateResponse;

use crate::auth;
use crate::error::DesktopError;
use crate::state::AppState;

/// Swap the presented bearer for a fresh one. The old token keeps working
/// for the grace window.
pub async fn rotate(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<RotateResponse>, DesktopError> {
    let bearer = auth::bearer(&extensions)?;
    let issued = state.sessions.rotate(bearer)?;
    Ok(Json(RotateResponse::from(&issued)))
}

/// The presenting device revokes itself.
pub async fn unpair(
    State(state): State<AppState>,
    extensions: Extensions,
) -> Result<Json<serde_json::Value>, DesktopError> {
    let bearer = auth::bearer(&extensions)?;
    let device_id = state.sessions.unpair(bearer)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "status": "revoked",
    })))
}
