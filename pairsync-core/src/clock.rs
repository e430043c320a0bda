//! Injectable time source.
//!
//! Every expiry decision in this crate (ticket TTL, token lifetime, grace
//! windows, certificate validity) reads the time through a [`Clock`], so the
//! state machines can be driven deterministically in tests.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A source of wall-clock time in Unix seconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current Unix timestamp in seconds.
    fn now(&self) -> i64;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Convenience constructor returning a shared handle.
    pub fn shared() -> SharedClock {
        Arc::new(SystemClock)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and simulations.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the component under test and keep another to move time forward. Time may
/// also be set backwards to simulate skew.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Move time forward by `secs`.
    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp.
    pub fn set(&self, ts: i64) {
        self.now.store(ts, Ordering::SeqCst);
    }

    /// Shared handle pointing at the same instant as `self`.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_and_sets() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.now(), 100);

        clock.advance(30);
        assert_eq!(clock.now(), 130);

        clock.set(50);
        assert_eq!(clock.now(), 50);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::new(0);
        let shared = clock.shared();

        clock.advance(10);
        assert_eq!(shared.now(), 10);
    }

    #[test]
    fn system_clock_is_recent() {
        // 2023-01-01
        assert!(SystemClock.now() > 1_672_531_200);
    }
}
