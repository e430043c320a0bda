//! Companion sync driver.
//!
//! Keeps a [`CompanionCache`] current by pulling from its cursor, falling back
//! to a full snapshot on a version gap, and consuming pushed messages from an
//! open channel. Transport failures are retried with exponential backoff; the
//! cursor is only ever moved by a successful apply, so a retry resumes
//! exactly where the last one stopped.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cache::{ApplyOutcome, CompanionCache};
use super::models::{DeltaBatch, SyncMessage};
use super::SyncError;
use crate::config::RetryPolicy;
use crate::session::TokenError;
use crate::{PairSyncError, Result};

/// Where deltas and snapshot pages come from.
#[allow(async_fn_in_trait)]
pub trait DeltaSource {
    async fn pull(&self, since_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch>;

    async fn snapshot_page(&self, after_version: u64, max_batch_size: Option<usize>) -> Result<DeltaBatch>;
}

/// Receiving half of a push channel.
#[allow(async_fn_in_trait)]
pub trait DuplexChannel {
    /// Next message, or `None` once the channel is closed.
    async fn recv(&mut self) -> Option<SyncMessage>;
}

impl DuplexChannel for mpsc::Receiver<SyncMessage> {
    async fn recv(&mut self) -> Option<SyncMessage> {
        mpsc::Receiver::recv(self).await
    }
}

/// Why [`CompanionSync::run_push`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushExit {
    /// The desktop closed the channel.
    Closed,
    /// Nothing arrived within the idle timeout.
    IdleTimeout,
    /// The desktop ordered a wipe; the cache has been purged.
    Wiped,
}

fn is_transport(err: &PairSyncError) -> bool {
    matches!(err, PairSyncError::Sync(SyncError::TransportInterrupted(_)))
}

/// Drives a companion cache against a desktop.
pub struct CompanionSync {
    cache: CompanionCache,
    retry: RetryPolicy,
    batch_size: Option<usize>,
}

impl CompanionSync {
    pub fn new(cache: CompanionCache, retry: RetryPolicy) -> Self {
        Self {
            cache,
            retry,
            batch_size: None,
        }
    }

    /// Request this batch size instead of the desktop default.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn cache(&self) -> &CompanionCache {
        &self.cache
    }

    /// Pull until the cache has everything the desktop has. Returns the
    /// final cursor.
    pub async fn catch_up<S: DeltaSource>(&self, source: &S) -> Result<u64> {
        let result = self.catch_up_inner(source).await;
        self.handle_fatal(result)
    }

    async fn catch_up_inner<S: DeltaSource>(&self, source: &S) -> Result<u64> {
        loop {
            let cursor = self.cache.cursor()?;
            let batch = match self
                .with_retry(|| source.pull(cursor, self.batch_size))
                .await
            {
                Ok(batch) => batch,
                Err(PairSyncError::Sync(SyncError::VersionGap { retained_floor, .. })) => {
                    info!(
                        "Cursor {} predates retained floor {}; taking a full snapshot",
                        cursor, retained_floor
                    );
                    return self.resync_inner(source).await;
                }
                Err(e) => return Err(e),
            };

            match self.cache.apply_delta(&batch)? {
                ApplyOutcome::Applied { cursor, .. } if !batch.has_more => {
                    debug!("Caught up at version {}", cursor);
                    return Ok(cursor);
                }
                ApplyOutcome::Applied { .. } => continue,
                ApplyOutcome::NeedsPull { cursor } => {
                    return Err(SyncError::ApplyIntegrityViolation(format!(
                        "pulled batch starts at {} but cursor is {}",
                        batch.since_version, cursor
                    ))
                    .into());
                }
            }
        }
    }

    /// Discard the cached profile and rebuild it from a full snapshot.
    pub async fn resync<S: DeltaSource>(&self, source: &S) -> Result<u64> {
        let result = self.resync_inner(source).await;
        self.handle_fatal(result)
    }

    async fn resync_inner<S: DeltaSource>(&self, source: &S) -> Result<u64> {
        let mut after = 0;
        loop {
            let page = self
                .with_retry(|| source.snapshot_page(after, self.batch_size))
                .await?;
            match self.cache.apply_delta(&page)? {
                ApplyOutcome::Applied { cursor, .. } if !page.has_more => {
                    info!("Snapshot complete at version {}", cursor);
                    return Ok(cursor);
                }
                ApplyOutcome::Applied { cursor, .. } => after = cursor,
                ApplyOutcome::NeedsPull { cursor } => {
                    return Err(SyncError::ApplyIntegrityViolation(format!(
                        "snapshot page starts at {} but cursor is {}",
                        page.since_version, cursor
                    ))
                    .into());
                }
            }
        }
    }

    /// Consume pushed messages until the channel closes, goes idle, or
    /// delivers a wipe. Gaps in the pushed stream are filled by pulling from
    /// `source`.
    pub async fn run_push<C: DuplexChannel, S: DeltaSource>(
        &self,
        channel: &mut C,
        source: &S,
    ) -> Result<PushExit> {
        let result = self.push_loop(channel, source).await;
        self.handle_fatal(result)
    }

    async fn push_loop<C: DuplexChannel, S: DeltaSource>(
        &self,
        channel: &mut C,
        source: &S,
    ) -> Result<PushExit> {
        let idle = Duration::from_secs(self.retry.idle_timeout_secs);
        loop {
            let message = match tokio::time::timeout(idle, channel.recv()).await {
                Err(_) => {
                    warn!("Push channel idle for {:?}; reconnecting", idle);
                    return Ok(PushExit::IdleTimeout);
                }
                Ok(None) => return Ok(PushExit::Closed),
                Ok(Some(message)) => message,
            };

            match message {
                SyncMessage::Change(batch) => {
                    if let ApplyOutcome::NeedsPull { cursor } = self.cache.apply_delta(&batch)? {
                        debug!("Pushed change past cursor {}; pulling", cursor);
                        self.catch_up_inner(source).await?;
                    }
                }
                SyncMessage::Heartbeat { head_version } => {
                    let cursor = self.cache.cursor()?;
                    if head_version > cursor {
                        self.catch_up_inner(source).await?;
                    } else if head_version < cursor {
                        warn!(
                            "Cache cursor {} is ahead of desktop head {}; resyncing",
                            cursor, head_version
                        );
                        self.resync_inner(source).await?;
                    }
                }
                SyncMessage::Resync => {
                    self.resync_inner(source).await?;
                }
                SyncMessage::Wipe => {
                    warn!("Desktop revoked this device; wiping local data");
                    self.cache.purge()?;
                    return Ok(PushExit::Wiped);
                }
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Err(e) if is_transport(&e) && attempt < attempts => {
                    let delay = self.retry.backoff_ms(attempt);
                    warn!(
                        "Sync attempt {}/{} failed: {}; retrying in {} ms",
                        attempt, attempts, e, delay
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Revocation purges everything; an integrity violation drops the
    /// profile so the next session starts from a snapshot.
    fn handle_fatal<T>(&self, result: Result<T>) -> Result<T> {
        match &result {
            Err(PairSyncError::Token(TokenError::TokenRevoked)) => {
                warn!("Session revoked; purging cached data");
                self.cache.purge()?;
            }
            Err(PairSyncError::Sync(SyncError::ApplyIntegrityViolation(reason))) => {
                warn!("Integrity violation ({}); dropping cached profile", reason);
                self.cache.clear_profile()?;
            }
            _ => {}
        }
        result
    }
}
