//! Bearer and loopback middleware.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, Request};
use axum::middleware::Next;
use axum::response::Response;
use pairsync_core::{Authenticated, TokenError};

use crate::error::DesktopError;
use crate::state::AppState;

/// Raw bearer of the authenticated request, for handlers that act on the
/// token itself (rotate, unpair, the duplex channel).
#[derive(Clone)]
pub struct BearerToken(pub String);

/// Bearer auth middleware: re-authenticates the token on every request.
pub async fn bearer_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, DesktopError> {
    let bearer = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(DesktopError::MissingCredentials)?;

    let identity = match state.sessions.authenticate(&bearer) {
        Ok(identity) => identity,
        Err(e) if e.as_token_error() == Some(&TokenError::TokenRevoked) => {
            return Err(revoked(&state, &bearer));
        }
        Err(e) => return Err(e.into()),
    };

    request.extensions_mut().insert(identity);
    request.extensions_mut().insert(BearerToken(bearer));
    Ok(next.run(request).await)
}

/// Rejection of a revoked bearer. It carries the wipe order when the push
/// channel never delivered one.
fn revoked(state: &AppState, bearer: &str) -> DesktopError {
    let device_id = match state.sessions.revoked_device(bearer) {
        Ok(Some(device_id)) => device_id,
        Ok(None) => return DesktopError::Revoked { wipe: true },
        Err(e) => {
            tracing::warn!("Could not resolve revoked bearer: {}", e);
            return DesktopError::Revoked { wipe: true };
        }
    };
    match state.devices.acknowledge_wipe(&device_id) {
        Ok(wipe) => {
            if wipe {
                tracing::info!("Delivering pending wipe to device {}", device_id);
            }
            DesktopError::Revoked { wipe }
        }
        Err(e) => {
            tracing::warn!("Failed to clear wipe flag for {}: {}", device_id, e);
            DesktopError::Revoked { wipe: true }
        }
    }
}

/// Operator routes are only reachable from the desktop itself.
pub async fn require_loopback(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, DesktopError> {
    if !peer.ip().is_loopback() {
        tracing::warn!("Rejected operator request from {}", peer);
        return Err(DesktopError::Forbidden(
            "operator routes are loopback only".to_string(),
        ));
    }
    Ok(next.run(request).await)
}

pub fn identity(extensions: &Extensions) -> Result<&Authenticated, DesktopError> {
    extensions
        .get::<Authenticated>()
        .ok_or(DesktopError::MissingCredentials)
}

pub fn bearer(extensions: &Extensions) -> Result<&str, DesktopError> {
    extensions
        .get::<BearerToken>()
        .map(|b| b.0.as_str())
        .ok_or(DesktopError::MissingCredentials)
}
