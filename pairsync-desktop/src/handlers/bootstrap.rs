//! Unauthenticated bootstrap endpoints.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;

use crate::state::AppState;

/// Root certificate in DER form. Companions accept it only if its
/// fingerprint matches the one pinned in their pairing payload.
pub async fn root_certificate(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/pkix-cert")],
        state.ca.get_root_certificate(),
    )
}

pub async fn health() -> &'static str {
    "ok"
}
