//! TLS termination for the service endpoint.
//!
//! The serving leaf is renewed while the daemon runs, so certificates are
//! picked per handshake from a [`LeafResolver`] rather than fixed in the
//! server config.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use pairsync_core::ca::IssuedLeaf;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PENDING_CONNECTIONS: usize = 64;

fn certified_key(leaf: &IssuedLeaf, root_der: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let chain = vec![
        CertificateDer::from(leaf.der.clone()),
        CertificateDer::from(root_der.to_vec()),
    ];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.private_key_der.to_vec()));
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("serving leaf key: {}", e))?;
    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Hands the current serving leaf to every handshake.
pub struct LeafResolver {
    current: RwLock<Arc<CertifiedKey>>,
}

impl LeafResolver {
    pub fn new(leaf: &IssuedLeaf, root_der: &[u8]) -> anyhow::Result<Self> {
        Ok(Self {
            current: RwLock::new(certified_key(leaf, root_der)?),
        })
    }

    /// Serve `leaf` from the next handshake on.
    pub fn update(&self, leaf: &IssuedLeaf, root_der: &[u8]) -> anyhow::Result<()> {
        let key = certified_key(leaf, root_der)?;
        let mut current = self
            .current
            .write()
            .map_err(|_| anyhow::anyhow!("serving key lock poisoned"))?;
        *current = key;
        Ok(())
    }
}

impl fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LeafResolver(..)")
    }
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().ok().map(|key| Arc::clone(&key))
    }
}

/// rustls server config backed by `resolver`. HTTP/1.1 only, so the push
/// channel can upgrade.
pub fn server_config(resolver: Arc<LeafResolver>) -> anyhow::Result<Arc<ServerConfig>> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// TCP listener that yields connections once their TLS handshake is done.
///
/// Handshakes run on their own tasks so a stalled client does not hold up
/// the others.
pub struct TlsListener {
    incoming: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    local_addr: SocketAddr,
}

impl TlsListener {
    pub async fn bind(addr: SocketAddr, config: Arc<ServerConfig>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (tx, incoming) = mpsc::channel(PENDING_CONNECTIONS);
        tokio::spawn(accept_loop(listener, TlsAcceptor::from(config), tx));
        Ok(Self {
            incoming,
            local_addr,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    tx: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    loop {
        let (tcp, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!("Service listener accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = tx.closed() => break,
        };

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    let _ = tx.send((stream, peer)).await;
                }
                Ok(Err(e)) => tracing::debug!("TLS handshake with {} failed: {}", peer, e),
                Err(_) => tracing::debug!("TLS handshake with {} timed out", peer),
            }
        });
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(conn) => conn,
            // The accept loop outlives its receiver.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}
