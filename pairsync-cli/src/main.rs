use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pairsync_core::audit::{AuditEventType, AuditLogger};
use pairsync_core::client::{fetch_root_certificate, DesktopClient};
use pairsync_core::pairing::PairingAttempt;
use pairsync_core::platform::{ca_dir, companion_db_path, desktop_db_path};
use pairsync_core::sync::{CompanionCredentials, PushExit};
use pairsync_core::{
    BootstrapPayload, CaManager, CertificateError, CompanionCache, CompanionSync, CoreConfig,
    Database, DeviceRegistry, PairSyncError, PairingCoordinator, ProfileStore,
    SessionTokenManager, SharedClock, SyncError, SystemClock, TokenError, TrustAnchor,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const TRUST_ANCHOR_FILE: &str = "trust-anchor.json";

/// PairSync - pair companion devices with a desktop and keep them in sync
#[derive(Parser)]
#[command(name = "pairsync")]
#[command(about = "Pair companion devices with a desktop and keep them in sync", long_about = None)]
struct Cli {
    /// Data directory (desktop state, or the companion cache)
    #[arg(short, long, global = true, env = "PAIRSYNC_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Daemon configuration file; only its `[core]` policies are used
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the desktop database and certificate authority
    Init,

    /// Show the root certificate authority
    CaInfo,

    /// Issue a pairing ticket (the desktop daemon must have started once)
    Ticket {
        /// Profile the paired device will read
        #[arg(long)]
        profile: String,
    },

    /// List pairing tickets
    Tickets,

    /// Cancel an unredeemed pairing ticket
    Cancel {
        ticket_id: Uuid,
    },

    /// List known devices
    Devices,

    /// Revoke a device
    Revoke {
        device_id: Uuid,
    },

    /// Commit a record to a profile
    Put {
        #[arg(long)]
        profile: String,
        #[arg(long)]
        id: String,
        /// Record body
        value: String,
    },

    /// Delete a record from a profile
    Delete {
        #[arg(long)]
        profile: String,
        #[arg(long)]
        id: String,
    },

    /// Prune tombstones past retention
    Prune,

    /// Show recent security audit entries
    Audit {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only entries at or above this severity (0-5)
        #[arg(long)]
        min_severity: Option<u8>,
    },

    /// Companion: pair with a desktop using a pairing URI
    Pair {
        uri: String,
        /// Name shown on the desktop
        #[arg(long, default_value = "pairsync companion")]
        name: String,
    },

    /// Companion: bring the cache up to date
    Pull {
        /// Discard the cache and take a full snapshot
        #[arg(long)]
        resync: bool,
    },

    /// Companion: stay connected and apply pushed changes until interrupted
    Watch,

    /// Companion: list cached records
    Show,

    /// Companion: unpair and purge the cache
    Unpair,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    core: CoreConfig,
}

fn load_core_config(path: Option<&Path>) -> Result<CoreConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            let file: FileConfig = toml_dep::from_str(&content)?;
            Ok(file.core)
        }
        None => Ok(CoreConfig::default()),
    }
}

/// Desktop-side components over the desktop database.
struct Desktop {
    dir: PathBuf,
    db: Database,
    clock: SharedClock,
    config: CoreConfig,
    audit: AuditLogger,
}

impl Desktop {
    fn open(dir: &Path, config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::open(desktop_db_path(dir))?;
        db.initialize_desktop_schema()?;
        Ok(Self {
            dir: dir.to_path_buf(),
            db,
            clock: SystemClock::shared(),
            config,
            audit: AuditLogger::new(dir)?,
        })
    }

    fn ca(&self) -> Result<CaManager> {
        Ok(CaManager::load_or_create(
            &ca_dir(&self.dir),
            self.config.ca.clone(),
            self.clock.clone(),
        )?
        .with_audit(self.audit.clone()))
    }

    fn sessions(&self) -> Result<SessionTokenManager> {
        Ok(SessionTokenManager::new(
            self.db.clone(),
            self.config.session.clone(),
            self.clock.clone(),
        )?
        .with_audit(self.audit.clone()))
    }

    fn pairing(&self) -> Result<PairingCoordinator> {
        Ok(PairingCoordinator::new(
            self.db.clone(),
            self.config.pairing.clone(),
            self.sessions()?,
            self.clock.clone(),
        )
        .with_audit(self.audit.clone()))
    }

    fn store(&self) -> ProfileStore {
        ProfileStore::new(self.db.clone(), self.clock.clone())
    }

    fn trust_anchor(&self) -> Result<TrustAnchor> {
        let path = self.dir.join(TRUST_ANCHOR_FILE);
        let bytes = std::fs::read(&path).with_context(|| {
            format!(
                "read {} (start pairsync-desktop once to issue the serving leaf)",
                path.display()
            )
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Companion-side state: the cache database and its credentials.
struct Companion {
    db: Database,
    clock: SharedClock,
    config: CoreConfig,
    audit: AuditLogger,
}

impl Companion {
    fn open(dir: &Path, config: CoreConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::open(companion_db_path(dir))?;
        db.initialize_companion_schema()?;
        Ok(Self {
            db,
            clock: SystemClock::shared(),
            config,
            audit: AuditLogger::new(dir)?,
        })
    }

    /// Record a pin mismatch before handing the error back.
    fn note_mismatch(&self, e: PairSyncError) -> PairSyncError {
        if let PairSyncError::Certificate(CertificateError::FingerprintMismatch {
            expected,
            presented,
        }) = &e
        {
            self.audit.record(
                AuditEventType::FingerprintMismatch {
                    expected: expected.clone(),
                    presented: presented.clone(),
                },
                "pairing",
            );
        }
        e
    }

    fn credentials(&self) -> Result<CompanionCredentials> {
        match CompanionCredentials::load(&self.db)? {
            Some(credentials) => Ok(credentials),
            None => bail!("not paired; run `pairsync pair <uri>` first"),
        }
    }

    fn sync(&self, profile_scope: &str) -> CompanionSync {
        let cache = CompanionCache::new(self.db.clone(), self.clock.clone(), profile_scope);
        CompanionSync::new(cache, self.config.retry.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .init();

    let cli = Cli::parse();
    let dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(pairsync_core::get_data_dir);
    let config = load_core_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => {
            let desktop = Desktop::open(&dir, config)?;
            let ca = desktop.ca()?;
            if ca.was_created() {
                println!("Created certificate authority in {}", ca.dir().display());
            } else {
                println!("Certificate authority already exists in {}", ca.dir().display());
            }
            println!("Root fingerprint: {}", ca.root_fingerprint());
        }
        Commands::CaInfo => {
            let desktop = Desktop::open(&dir, config)?;
            let ca = desktop.ca()?;
            let meta = ca.metadata();
            println!("Common name:  {}", meta.common_name);
            println!("Serial:       {}", meta.serial);
            println!("Not before:   {}", format_ts(meta.not_before));
            println!("Not after:    {}", format_ts(meta.not_after));
            println!("Fingerprint:  {}", meta.fingerprint);
        }
        Commands::Ticket { profile } => {
            let desktop = Desktop::open(&dir, config)?;
            let anchor = desktop.trust_anchor()?;
            let issued = desktop.pairing()?.issue_ticket(&profile, &anchor)?;
            println!("Ticket {} for profile {}", issued.ticket_id, profile);
            println!("Expires at {}", format_ts(issued.payload.expires_at));
            println!("{}", issued.payload.to_uri()?);
        }
        Commands::Tickets => {
            let desktop = Desktop::open(&dir, config)?;
            for t in desktop.pairing()?.list_tickets()? {
                println!(
                    "{}  {:<10} {:<9} expires {}{}",
                    t.ticket_id,
                    t.profile_scope,
                    t.state.as_str(),
                    format_ts(t.expires_at),
                    t.device_id
                        .map(|d| format!("  device {}", d))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Cancel { ticket_id } => {
            let desktop = Desktop::open(&dir, config)?;
            if desktop.pairing()?.cancel_ticket(&ticket_id)? {
                println!("Cancelled ticket {}", ticket_id);
            } else {
                bail!("no unredeemed ticket {}", ticket_id);
            }
        }
        Commands::Devices => {
            let desktop = Desktop::open(&dir, config)?;
            for d in DeviceRegistry::new(desktop.db.clone()).list()? {
                println!(
                    "{}  {:<20} {:<10} {:<8} last seen {}",
                    d.device_id,
                    d.display_name,
                    d.profile_scope,
                    d.pairing_state.as_str(),
                    d.last_seen_at.map(format_ts).unwrap_or_else(|| "never".to_string())
                );
            }
        }
        Commands::Revoke { device_id } => {
            let desktop = Desktop::open(&dir, config)?;
            let tokens = desktop.sessions()?.revoke(&device_id)?;
            println!("Revoked device {} ({} live tokens)", device_id, tokens);
        }
        Commands::Put { profile, id, value } => {
            let desktop = Desktop::open(&dir, config)?;
            let entity = desktop.store().commit(&profile, &id, value.as_bytes())?;
            println!("{}/{} at version {}", profile, id, entity.version);
        }
        Commands::Delete { profile, id } => {
            let desktop = Desktop::open(&dir, config)?;
            match desktop.store().delete(&profile, &id)? {
                Some(tombstone) => {
                    println!("Deleted {}/{} at version {}", profile, id, tombstone.version)
                }
                None => bail!("no record {}/{}", profile, id),
            }
        }
        Commands::Prune => {
            let desktop = Desktop::open(&dir, config)?;
            let retention = desktop.config.sync.tombstone_retention_secs;
            let pruned = desktop.store().prune_tombstones(retention)?;
            println!("Pruned {} tombstones", pruned);
        }
        Commands::Audit {
            limit,
            min_severity,
        } => {
            let audit = AuditLogger::new(&dir)?;
            let entries = match min_severity {
                Some(min) => audit.get_entries_by_severity(min)?,
                None => audit.get_entries(limit)?,
            };
            for entry in entries.into_iter().take(limit) {
                println!(
                    "{}  [{}]  {}  {}",
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.severity,
                    serde_json::to_string(&entry.event_type)?,
                    entry.context
                );
            }
        }
        Commands::Pair { uri, name } => {
            let companion = Companion::open(&dir, config)?;
            pair(&companion, &uri, &name).await?;
        }
        Commands::Pull { resync } => {
            let companion = Companion::open(&dir, config)?;
            pull(&companion, resync).await?;
        }
        Commands::Watch => {
            let companion = Companion::open(&dir, config)?;
            watch(&companion).await?;
        }
        Commands::Show => {
            let companion = Companion::open(&dir, config)?;
            let credentials = companion.credentials()?;
            let sync = companion.sync(&credentials.profile_scope);
            println!(
                "Profile {} at version {}",
                credentials.profile_scope,
                sync.cache().cursor()?
            );
            for e in sync.cache().list()? {
                println!(
                    "{:>6}  {}  {}",
                    e.version,
                    e.entity_id,
                    String::from_utf8_lossy(&e.payload)
                );
            }
        }
        Commands::Unpair => {
            let companion = Companion::open(&dir, config)?;
            let credentials = companion.credentials()?;
            let mut client = DesktopClient::from_credentials(&credentials)?;
            let result = client.unpair().await;
            companion.sync(&credentials.profile_scope).cache().purge()?;
            match result {
                Ok(()) => println!("Unpaired device {}", credentials.device_id),
                // Already revoked on the desktop; the local purge is what is left.
                Err(e) if e.as_token_error().is_some() => {
                    println!("Desktop no longer accepts this device; local cache purged")
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

async fn pair(companion: &Companion, uri: &str, name: &str) -> Result<()> {
    let payload = BootstrapPayload::from_uri(uri)?;
    if payload.is_expired(companion.clock.now()) {
        bail!("pairing payload expired at {}", format_ts(payload.expires_at));
    }

    info!("Fetching root certificate from {}", payload.bootstrap_url);
    let root = fetch_root_certificate(&payload)
        .await
        .map_err(|e| companion.note_mismatch(e))?;
    let mut client = DesktopClient::connect(&payload, &root)?;
    client
        .verify_service_identity()
        .await
        .map_err(|e| companion.note_mismatch(e))?;

    let attempt = PairingAttempt::new(payload.clone());
    let response = client.redeem(&attempt.request(name)).await?;
    let bearer = attempt.complete(&response)?;
    client.set_bearer(bearer.clone());

    let credentials = CompanionCredentials {
        device_id: response.device_id,
        bearer,
        profile_scope: response.profile_scope.clone(),
        ca_fingerprint: payload.ca_fingerprint.clone(),
        leaf_fingerprint: payload.leaf_fingerprint.clone(),
        service_url: payload.service_url.clone(),
        root_certificate: root,
        paired_at: companion.clock.now(),
    };
    credentials.save(&companion.db)?;
    println!(
        "Paired as device {} for profile {}",
        response.device_id, response.profile_scope
    );

    let cursor = companion
        .sync(&response.profile_scope)
        .resync(&client)
        .await?;
    println!("Synced to version {}", cursor);
    Ok(())
}

/// Trade the stored bearer for a fresh one and persist it.
async fn rotate(
    companion: &Companion,
    client: &mut DesktopClient,
    credentials: &mut CompanionCredentials,
    sync: &CompanionSync,
) -> Result<()> {
    // A token that already lapsed means pairing again.
    match client.rotate().await {
        Ok(rotated) => {
            credentials.update_bearer(&companion.db, rotated.bearer)?;
            Ok(())
        }
        Err(e) => Err(session_failure(e, sync)),
    }
}

fn session_failure(e: PairSyncError, sync: &CompanionSync) -> anyhow::Error {
    match e.as_token_error() {
        Some(TokenError::TokenRevoked) => match sync.cache().purge() {
            Ok(()) => anyhow::anyhow!("this device was revoked; cached data purged"),
            Err(purge) => anyhow::anyhow!("this device was revoked; purge failed: {}", purge),
        },
        Some(_) => anyhow::anyhow!("session expired ({}); pair again", e),
        None => e.into(),
    }
}

async fn pull(companion: &Companion, resync: bool) -> Result<()> {
    let mut credentials = companion.credentials()?;
    let mut client = DesktopClient::from_credentials(&credentials)?;
    let sync = companion.sync(&credentials.profile_scope);

    rotate(companion, &mut client, &mut credentials, &sync).await?;

    let cursor = if resync {
        sync.resync(&client).await?
    } else {
        sync.catch_up(&client).await?
    };
    println!("Profile {} at version {}", credentials.profile_scope, cursor);
    Ok(())
}

/// How long one push session runs before the bearer is rotated again. The
/// desktop closes the channel once its bearer expires.
fn session_window(token_lifetime_secs: i64) -> Duration {
    Duration::from_secs((token_lifetime_secs / 2).max(1) as u64)
}

fn is_transport(e: &PairSyncError) -> bool {
    matches!(e, PairSyncError::Sync(SyncError::TransportInterrupted(_)))
}

async fn watch(companion: &Companion) -> Result<()> {
    let mut credentials = companion.credentials()?;
    let mut client = DesktopClient::from_credentials(&credentials)?;
    let sync = companion.sync(&credentials.profile_scope);
    let window = session_window(companion.config.session.token_lifetime_secs);
    let retry = companion.config.retry.clone();
    let mut failures = 0;

    println!("Watching profile {} (Ctrl-C to stop)", credentials.profile_scope);
    loop {
        let session = async {
            rotate(companion, &mut client, &mut credentials, &sync).await?;
            let cursor = sync.catch_up(&client).await?;
            println!("Profile {} at version {}", credentials.profile_scope, cursor);
            let mut channel = client
                .open_channel()
                .await
                .map_err(|e| session_failure(e, &sync))?;
            let pushed = tokio::time::timeout(window, sync.run_push(&mut channel, &client)).await;
            let exit = match pushed {
                Ok(exit) => exit?,
                Err(_) => PushExit::Closed,
            };
            channel.close().await;
            anyhow::Ok(exit)
        };

        let outcome = tokio::select! {
            outcome = session => outcome,
            _ = tokio::signal::ctrl_c() => {
                println!("Stopped");
                return Ok(());
            }
        };

        match outcome {
            Ok(PushExit::Wiped) => {
                println!("This device was revoked; cached data purged");
                return Ok(());
            }
            Ok(exit) => {
                failures = 0;
                info!("Push session ended ({:?}); reconnecting", exit);
            }
            Err(e) => match e.downcast_ref::<PairSyncError>() {
                Some(err) if is_transport(err) => {
                    failures += 1;
                    let delay = retry.backoff_ms(failures.min(retry.max_attempts.max(1)));
                    warn!("Desktop unreachable ({}); retrying in {} ms", err, delay);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                _ => return Err(e),
            },
        }
    }
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}
