//! Axum router setup.
//!
//! The daemon serves three listeners: the plain bootstrap endpoint, the
//! TLS companion endpoint, and the loopback operator endpoint. Each gets
//! its own router so a route can only be reached where it is mounted.

use crate::auth::{bearer_middleware, require_loopback};
use crate::config::DesktopConfig;
use crate::handlers::{bootstrap, devices, pairing, session, sync};
use crate::state::AppState;
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

fn with_common_layers(router: Router<AppState>, config: &DesktopConfig) -> Router<AppState> {
    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(config.max_payload_size))
}

/// Plain HTTP routes a companion needs before it trusts the root.
pub fn bootstrap_router(state: AppState, config: &DesktopConfig) -> Router {
    let router = Router::new()
        .route(
            "/api/v1/bootstrap/root-certificate",
            get(bootstrap::root_certificate),
        )
        .route("/health", get(bootstrap::health));
    with_common_layers(router, config).with_state(state)
}

/// Routes served over TLS with the serving leaf.
pub fn companion_router(state: AppState, config: &DesktopConfig) -> Router {
    // Bearer-authenticated companion routes
    let authenticated = Router::new()
        .route("/api/v1/session/rotate", post(session::rotate))
        .route("/api/v1/session/unpair", post(session::unpair))
        .route("/api/v1/sync/pull", post(sync::pull))
        .route("/api/v1/sync/snapshot", post(sync::snapshot))
        .route("/api/v1/sync/channel", get(sync::channel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            bearer_middleware,
        ));

    let router = Router::new()
        .merge(authenticated)
        .route("/api/v1/pairing/redeem", post(pairing::redeem))
        .route("/health", get(bootstrap::health));
    with_common_layers(router, config).with_state(state)
}

/// Ticket and device management, for the loopback listener only.
pub fn operator_router(state: AppState, config: &DesktopConfig) -> Router {
    let router = Router::new()
        .route(
            "/api/v1/pairing/tickets",
            post(pairing::issue_ticket).get(pairing::list_tickets),
        )
        .route("/api/v1/pairing/tickets/{id}", delete(pairing::cancel_ticket))
        .route("/api/v1/devices", get(devices::list_devices))
        .route("/api/v1/devices/{id}/revoke", post(devices::revoke_device))
        .route("/health", get(bootstrap::health))
        .layer(middleware::from_fn(require_loopback));
    with_common_layers(router, config).with_state(state)
}
