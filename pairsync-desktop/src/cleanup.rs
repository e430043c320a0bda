//! Background maintenance: ticket expiry, token and leaf pruning, serving
//! leaf renewal and tombstone retention.

use crate::state::AppState;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;

const LIMITER_IDLE: Duration = Duration::from_secs(600);

pub fn spawn_cleanup_task(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.cleanup_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        loop {
            interval.tick().await;
            if let Err(e) = run_cleanup(&state) {
                tracing::error!("Cleanup error: {}", e);
            }
        }
    })
}

pub fn run_cleanup(state: &AppState) -> anyhow::Result<()> {
    let expired = state.pairing.expire_tickets()?;
    let purged = state.pairing.purge_tickets()?;
    let tokens = state.sessions.prune()?;
    let leaves = state.ca.prune_expired_leaves();
    state.renew_serving_leaf_if_due()?;
    let tombstones = state.engine.prune_tombstones()?;
    state.redeem_limiter.prune(LIMITER_IDLE);

    tracing::debug!(
        "Cleanup completed: {} tickets expired, {} purged, {} tokens, {} leaves, {} tombstones",
        expired,
        purged,
        tokens,
        leaves,
        tombstones
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    #[test]
    fn cleanup_expires_tickets_and_renews_leaf() {
        let dir = tempfile::tempdir().unwrap();
        let (clock, state) = test_state(dir.path());
        state
            .pairing
            .issue_ticket("personal", &state.trust_anchor())
            .unwrap();
        let leaf = state.serving_leaf_fingerprint();

        clock.advance(state.config.core.pairing.ticket_ttl_secs);
        run_cleanup(&state).unwrap();
        // Expired and past its window in the same pass, so it is gone.
        assert!(state.pairing.list_tickets().unwrap().is_empty());
        assert_eq!(state.serving_leaf_fingerprint(), leaf);

        clock.advance(state.ca.policy().default_leaf_lifetime_secs);
        run_cleanup(&state).unwrap();
        assert_ne!(state.serving_leaf_fingerprint(), leaf);
        assert_eq!(state.ca.live_leaf_count(), 1);
    }
}
