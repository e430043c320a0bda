//! PairSync desktop daemon
//!
//! Serves the local certificate authority's root over the plain bootstrap
//! endpoint, redeems pairing tickets and serves delta sync to paired
//! companions over TLS, and takes operator requests on loopback. The desktop is the only writer; companions hold read-only
//! caches.

mod auth;
mod cleanup;
mod config;
mod error;
mod handlers;
mod rate_limit;
mod server;
mod state;
mod tls;

use std::future::IntoFuture;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use pairsync_core::audit::AuditEventType;
use pairsync_core::SystemClock;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pairsync-desktop", about = "PairSync desktop daemon")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = pairsync_core::platform::default_config_path())]
    config: PathBuf,

    /// Bootstrap listen address override
    #[arg(short, long)]
    listen: Option<String>,

    /// Data directory override
    #[arg(short, long, env = "PAIRSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// LAN address advertised to companions
    #[arg(short, long)]
    advertised_ip: Option<IpAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut cfg = if cli.config.exists() {
        config::DesktopConfig::load(&cli.config)?
    } else {
        tracing::info!("No config file found, using defaults");
        config::DesktopConfig::default()
    };

    if let Some(listen) = cli.listen {
        cfg.listen_addr = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        cfg.data_dir = Some(data_dir);
    }
    if let Some(ip) = cli.advertised_ip {
        cfg.advertised_ip = ip;
    }

    let operator_addr = cfg.operator_listen_addr()?;
    let service_addr = cfg.service_listen_addr();
    tracing::info!(
        "Starting PairSync desktop: bootstrap {}, service {}, operator {}",
        cfg.listen_addr,
        service_addr,
        operator_addr
    );

    let state = state::AppState::initialize(cfg.clone(), SystemClock::shared())?;
    tracing::info!(
        "Root CA {} serving leaf {}",
        state.ca.root_fingerprint(),
        state.serving_leaf_fingerprint()
    );

    let bootstrap_listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    let service_listener =
        tls::TlsListener::bind(service_addr, tls::server_config(state.tls.clone())?).await?;
    let operator_listener = tokio::net::TcpListener::bind(operator_addr).await?;
    state
        .audit
        .record(AuditEventType::DaemonStarted, &service_addr.to_string());

    let cleanup = cleanup::spawn_cleanup_task(state.clone());
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let bootstrap = axum::serve(
        bootstrap_listener,
        server::bootstrap_router(state.clone(), &cfg)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx.clone()));
    let service = axum::serve(
        axum::serve::ListenerExt::tap_io(service_listener, |_| {}),
        server::companion_router(state.clone(), &cfg)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx.clone()));
    let operator = axum::serve(
        operator_listener,
        server::operator_router(state.clone(), &cfg)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(stopped(stop_rx));

    tokio::try_join!(
        bootstrap.into_future(),
        service.into_future(),
        operator.into_future()
    )?;

    cleanup.abort();
    state.audit.record(AuditEventType::DaemonStopped, "");
    tracing::info!("PairSync desktop stopped");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}
