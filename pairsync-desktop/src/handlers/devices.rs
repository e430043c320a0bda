//! Operator device management. Loopback only.

use axum::extract::{Path, State};
use axum::Json;
use pairsync_core::Device;
use uuid::Uuid;

use crate::error::DesktopError;
use crate::state::AppState;

pub async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, DesktopError> {
    Ok(Json(state.devices.list()?))
}

/// Revoke a device. Its tokens stop authenticating immediately and an open
/// channel receives a wipe before it is closed.
pub async fn revoke_device(
    State(state): State<AppState>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, DesktopError> {
    let revoked_tokens = state.sessions.revoke(&device_id)?;
    Ok(Json(serde_json::json!({
        "device_id": device_id,
        "status": "revoked",
        "revoked_tokens": revoked_tokens,
    })))
}
