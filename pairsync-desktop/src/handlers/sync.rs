//! Delta pull, snapshot paging and the push channel.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::Extensions;
use axum::response::Response;
use axum::Json;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use pairsync_core::sync::{PullRequest, SnapshotRequest};
use pairsync_core::{Authenticated, DeltaBatch, SyncMessage, TokenError};
use tokio::sync::mpsc;

use crate::auth;
use crate::error::DesktopError;
use crate::state::AppState;

pub async fn pull(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(req): Json<PullRequest>,
) -> Result<Json<DeltaBatch>, DesktopError> {
    let identity = auth::identity(&extensions)?;
    let batch = state
        .engine
        .pull(identity, req.since_version, req.max_batch_size)?;
    tracing::debug!(
        "Device {} pulled {} entities ({} -> {})",
        identity.device_id,
        batch.entities.len(),
        batch.since_version,
        batch.max_version
    );
    Ok(Json(batch))
}

pub async fn snapshot(
    State(state): State<AppState>,
    extensions: Extensions,
    Json(req): Json<SnapshotRequest>,
) -> Result<Json<DeltaBatch>, DesktopError> {
    let identity = auth::identity(&extensions)?;
    let page = state
        .engine
        .snapshot_page(identity, req.after_version, req.max_batch_size)?;
    Ok(Json(page))
}

/// Upgrade to the push channel. The first frame is a heartbeat with the
/// profile head.
pub async fn channel(
    State(state): State<AppState>,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Result<Response, DesktopError> {
    let identity = auth::identity(&extensions)?.clone();
    let bearer = auth::bearer(&extensions)?.to_string();
    let rx = state.engine.open_channel(&identity)?;

    Ok(ws.on_upgrade(move |socket| run_channel(socket, state, identity, bearer, rx)))
}

type Sender = SplitSink<WebSocket, Message>;

async fn send(sender: &mut Sender, message: &SyncMessage) -> bool {
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to encode sync message: {}", e);
            return false;
        }
    };
    sender.send(Message::Text(json.into())).await.is_ok()
}

async fn run_channel(
    socket: WebSocket,
    state: AppState,
    identity: Authenticated,
    bearer: String,
    mut rx: mpsc::Receiver<SyncMessage>,
) {
    let device_id = identity.device_id;
    let (mut sender, mut receiver) = socket.split();
    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        state.engine.policy().heartbeat_secs.max(1),
    ));
    // The opening heartbeat is already queued on `rx`.
    heartbeat.tick().await;

    // Set when the hub dropped our sender: revoked, replaced by a newer
    // channel of the same device, or too far behind.
    let mut detached = false;

    loop {
        tokio::select! {
            pushed = rx.recv() => match pushed {
                Some(message) => {
                    let wipe = message == SyncMessage::Wipe;
                    if !send(&mut sender, &message).await || wipe {
                        break;
                    }
                }
                None => {
                    detached = true;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                // The channel lives only as long as its bearer does.
                if let Err(e) = state.sessions.authenticate(&bearer) {
                    if e.as_token_error() == Some(&TokenError::TokenRevoked)
                        && send(&mut sender, &SyncMessage::Wipe).await
                    {
                        if let Err(e) = state.devices.acknowledge_wipe(&device_id) {
                            tracing::warn!("Failed to clear wipe flag for {}: {}", device_id, e);
                        }
                    }
                    tracing::info!("Closing push channel for {}: {}", device_id, e);
                    break;
                }
                match state.engine.heartbeat(&identity) {
                    Ok(message) => {
                        if !send(&mut sender, &message).await {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Heartbeat for {} failed: {}", device_id, e);
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // Companions only listen; pings are answered by the socket.
                Some(Ok(_)) => {}
            },
        }
    }

    if !detached {
        state.engine.close_channel(&device_id);
    }
    let _ = sender.close().await;
    tracing::info!("Push channel for device {} closed", device_id);
}
