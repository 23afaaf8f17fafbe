//! Time source abstraction.
//!
//! The reference implementation this kit is modeled on kept a single mutable
//! module-level clock that tests swapped out with `set_cur_ts_impl`/
//! `reset_cur_ts_impl`. That works, but it's global mutable state shared by
//! every test in the process. Here the clock is an explicit dependency,
//! threaded through construction, so two tests (or two hosts in the same
//! process) never fight over it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time, expressed as whole seconds since the Unix
/// epoch. Implementations must be cheap to call repeatedly — the scheduler
/// and worker pool call this on every tick.
pub trait Clock: Send + Sync {
    /// Current wall-clock time, in seconds since the Unix epoch.
    fn now_ts(&self) -> u64;
}

/// The real clock, backed by `SystemTime::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ts(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A clock tests can step by hand, so timing-sensitive scenarios (lease
/// expiry, TTL expiry, schedule recurrence) don't need real `sleep`s.
#[derive(Debug)]
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn new(start_ts: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ts),
        }
    }

    /// Advance the clock by `secs` seconds, returning the new timestamp.
    pub fn advance(&self, secs: u64) -> u64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }

    pub fn set(&self, ts: u64) {
        self.now.store(ts, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ts(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_roughly_now() {
        let clock = SystemClock;
        let ts = clock.now_ts();
        let real = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(ts.abs_diff(real) <= 1);
    }

    #[test]
    fn test_clock_advances_and_sets() {
        let clock = TestClock::new(1_000);
        assert_eq!(clock.now_ts(), 1_000);
        assert_eq!(clock.advance(5), 1_005);
        assert_eq!(clock.now_ts(), 1_005);
        clock.set(2_000);
        assert_eq!(clock.now_ts(), 2_000);
    }
}
