//! HTTP client used by a companion to talk to its desktop.
//!
//! Trust is bootstrapped from the pairing payload: the root certificate is
//! fetched over the plain bootstrap endpoint and accepted only if its
//! fingerprint matches the pinned one. After that the client trusts that
//! root and nothing else. Before any credential is sent, the leaf presented
//! by the service endpoint is checked against the pinned leaf fingerprint.
//! The push channel is a WebSocket over the same pinned TLS trust.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use rustls::pki_types::CertificateDer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::ca::{CertificateError, PinnedPeer};
use crate::pairing::{BootstrapPayload, PairingError, RedeemRequest, RedeemResponse};
use crate::session::{RotateResponse, TokenError};
use crate::sync::{
    CompanionCredentials, DeltaBatch, DeltaSource, DuplexChannel, PullRequest, SnapshotRequest,
    SyncError, SyncMessage,
};
use crate::{PairSyncError, Result};

const ROOT_CERTIFICATE_PATH: &str = "/api/v1/bootstrap/root-certificate";
const CHANNEL_PATH: &str = "/api/v1/sync/channel";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body produced by the desktop daemon.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    wipe: bool,
    #[serde(default)]
    profile_scope: Option<String>,
    #[serde(default)]
    since_version: Option<u64>,
    #[serde(default)]
    retained_floor: Option<u64>,
}

fn transport(e: reqwest::Error) -> PairSyncError {
    SyncError::TransportInterrupted(e.to_string()).into()
}

fn channel_transport(e: impl std::fmt::Display) -> PairSyncError {
    SyncError::TransportInterrupted(format!("push channel: {}", e)).into()
}

/// Map a non-success response back to the error the desktop raised.
fn map_error(status: StatusCode, body: ErrorBody) -> PairSyncError {
    if body.wipe {
        debug!("Desktop asked for a wipe ({})", body.error);
    }
    if status == StatusCode::UNAUTHORIZED {
        return TokenError::from_code(&body.error)
            .unwrap_or(TokenError::TokenInvalidSignature)
            .into();
    }
    if body.error == "version_gap" {
        return SyncError::VersionGap {
            profile_scope: body.profile_scope.unwrap_or_default(),
            since_version: body.since_version.unwrap_or_default(),
            retained_floor: body.retained_floor.unwrap_or_default(),
        }
        .into();
    }
    if let Some(e) = PairingError::from_code(&body.error, &body.message) {
        return e.into();
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return SyncError::TransportInterrupted(format!("desktop returned {}", status)).into();
    }
    PairSyncError::InvalidInput(format!("desktop returned {}: {}", status, body.message))
}

/// Fetch the desktop's root certificate and check it against the pinned
/// CA fingerprint. Returns the DER bytes.
pub async fn fetch_root_certificate(payload: &BootstrapPayload) -> Result<Vec<u8>> {
    let http = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(transport)?;
    let url = format!(
        "{}{}",
        payload.bootstrap_url.trim_end_matches('/'),
        ROOT_CERTIFICATE_PATH
    );

    let resp = http.get(&url).send().await.map_err(transport)?;
    if !resp.status().is_success() {
        let status = resp.status();
        return Err(SyncError::TransportInterrupted(format!(
            "bootstrap endpoint returned {}",
            status
        ))
        .into());
    }
    let der = resp.bytes().await.map_err(transport)?.to_vec();

    payload.pinned_peer().verify_root(&der).map_err(|e| {
        warn!("Root certificate from {} does not match the pinned fingerprint", url);
        e
    })?;
    Ok(der)
}

/// rustls config that trusts `root_der` and nothing else.
fn pinned_tls_config(root_der: &[u8]) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(root_der.to_vec()))
        .map_err(|e| CertificateError::Storage(format!("root certificate: {}", e)))?;
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| CertificateError::Storage(format!("tls config: {}", e)))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

/// WebSocket address of the push channel behind `service_url`.
fn channel_url(service_url: &str) -> String {
    let base = if let Some(rest) = service_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = service_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        service_url.to_string()
    };
    format!("{}{}", base.trim_end_matches('/'), CHANNEL_PATH)
}

/// HTTPS client bound to one desktop.
pub struct DesktopClient {
    http: reqwest::Client,
    tls: Arc<rustls::ClientConfig>,
    service_url: String,
    pinned: PinnedPeer,
    bearer: Option<String>,
    identity_verified: AtomicBool,
}

impl DesktopClient {
    /// Build a client that trusts only `root_der`.
    pub fn connect(payload: &BootstrapPayload, root_der: &[u8]) -> Result<Self> {
        Self::build(&payload.service_url, payload.pinned_peer(), root_der, None)
    }

    /// Rebuild a client from stored credentials. The service identity was
    /// verified at pairing time.
    pub fn from_credentials(credentials: &CompanionCredentials) -> Result<Self> {
        let client = Self::build(
            &credentials.service_url,
            credentials.pinned_peer(),
            &credentials.root_certificate,
            Some(credentials.bearer.clone()),
        )?;
        client.identity_verified.store(true, Ordering::SeqCst);
        Ok(client)
    }

    fn build(
        service_url: &str,
        pinned: PinnedPeer,
        root_der: &[u8],
        bearer: Option<String>,
    ) -> Result<Self> {
        let root = reqwest::Certificate::from_der(root_der)
            .map_err(|e| CertificateError::Storage(format!("root certificate: {}", e)))?;
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .tls_info(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(transport)?;

        Ok(Self {
            http,
            tls: pinned_tls_config(root_der)?,
            service_url: service_url.trim_end_matches('/').to_string(),
            pinned,
            bearer,
            identity_verified: AtomicBool::new(false),
        })
    }

    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    pub fn set_bearer(&mut self, bearer: String) {
        self.bearer = Some(bearer);
    }

    /// Check the leaf certificate presented by the service endpoint against
    /// the pinned fingerprint.
    pub async fn verify_service_identity(&self) -> Result<()> {
        let resp = self
            .http
            .get(format!("{}/health", self.service_url))
            .send()
            .await
            .map_err(transport)?;

        let presented = resp
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .ok_or_else(|| CertificateError::FingerprintMismatch {
                expected: self.pinned.leaf_fingerprint.clone(),
                presented: "none".to_string(),
            })?;
        self.pinned.verify_leaf(presented)?;

        self.identity_verified.store(true, Ordering::SeqCst);
        info!("Verified service identity of {}", self.service_url);
        Ok(())
    }

    fn require_verified(&self) -> Result<()> {
        if self.identity_verified.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PairSyncError::InvalidInput(
                "service identity has not been verified".to_string(),
            ))
        }
    }

    fn require_bearer(&self) -> Result<&str> {
        self.bearer
            .as_deref()
            .ok_or_else(|| PairSyncError::InvalidInput("not paired".to_string()))
    }

    /// Redeem a pairing ticket.
    pub async fn redeem(&self, request: &RedeemRequest) -> Result<RedeemResponse> {
        self.require_verified()?;
        self.post("/api/v1/pairing/redeem", request, None).await
    }

    /// Rotate the bearer; the new one replaces the old in this client.
    pub async fn rotate(&mut self) -> Result<RotateResponse> {
        let bearer = self.require_bearer()?.to_string();
        let rotated: RotateResponse = self
            .post("/api/v1/session/rotate", &serde_json::json!({}), Some(&bearer))
            .await?;
        self.bearer = Some(rotated.bearer.clone());
        Ok(rotated)
    }

    /// Revoke this device.
    pub async fn unpair(&mut self) -> Result<()> {
        let bearer = self.require_bearer()?.to_string();
        let _: serde_json::Value = self
            .post("/api/v1/session/unpair", &serde_json::json!({}), Some(&bearer))
            .await?;
        self.bearer = None;
        Ok(())
    }

    /// Open the push channel. A rejected upgrade maps to the same errors as
    /// a rejected request, so a revoked bearer surfaces as `TokenRevoked`.
    pub async fn open_channel(&self) -> Result<PushChannel> {
        self.require_verified()?;
        let bearer = self.require_bearer()?;

        let mut request = channel_url(&self.service_url)
            .into_client_request()
            .map_err(channel_transport)?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", bearer))
            .map_err(|e| PairSyncError::InvalidInput(format!("bearer: {}", e)))?;
        request.headers_mut().insert(header::AUTHORIZATION, auth);

        let connector = Connector::Rustls(self.tls.clone());
        match tokio_tungstenite::connect_async_tls_with_config(request, None, false, Some(connector))
            .await
        {
            Ok((stream, _)) => {
                debug!("Push channel open to {}", self.service_url);
                Ok(PushChannel { stream })
            }
            Err(tungstenite::Error::Http(resp)) => {
                let status = StatusCode::from_u16(resp.status().as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = resp
                    .body()
                    .as_deref()
                    .and_then(|b| serde_json::from_slice::<ErrorBody>(b).ok())
                    .unwrap_or_default();
                Err(map_error(status, body))
            }
            Err(e) => Err(channel_transport(e)),
        }
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T> {
        let mut req = self.http.post(format!("{}{}", self.service_url, path)).json(body);
        if let Some(bearer) = bearer {
            req = req.bearer_auth(bearer);
        }

        let resp = req.send().await.map_err(transport)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.json::<ErrorBody>().await.unwrap_or_default();
            return Err(map_error(status, body));
        }
        resp.json::<T>().await.map_err(transport)
    }
}

impl DeltaSource for DesktopClient {
    async fn pull(&self, since_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch> {
        let bearer = self.require_bearer()?;
        self.post(
            "/api/v1/sync/pull",
            &PullRequest {
                since_version,
                max_batch_size,
            },
            Some(bearer),
        )
        .await
    }

    async fn snapshot_page(&self, after_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch> {
        let bearer = self.require_bearer()?;
        self.post(
            "/api/v1/sync/snapshot",
            &SnapshotRequest {
                after_version,
                max_batch_size,
            },
            Some(bearer),
        )
        .await
    }
}

/// What one WebSocket frame means to the companion.
#[derive(Debug, PartialEq)]
enum Frame {
    Message(SyncMessage),
    Ignored,
    Closed,
}

fn decode_frame(frame: Message) -> Frame {
    match frame {
        Message::Text(text) => match serde_json::from_str::<SyncMessage>(&text) {
            Ok(message) => Frame::Message(message),
            Err(e) => {
                warn!("Ignoring malformed push message: {}", e);
                Frame::Ignored
            }
        },
        Message::Close(_) => Frame::Closed,
        _ => Frame::Ignored,
    }
}

/// Push channel to the desktop, read by [`crate::sync::CompanionSync::run_push`].
pub struct PushChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl PushChannel {
    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }
}

impl DuplexChannel for PushChannel {
    async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            let frame = match self.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!("Push channel error: {}", e);
                    return None;
                }
                None => return None,
            };
            match decode_frame(frame) {
                Frame::Message(message) => return Some(message),
                Frame::Ignored => {}
                Frame::Closed => return None,
            }
        }
    }
}
