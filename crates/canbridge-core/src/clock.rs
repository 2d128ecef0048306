//! Time abstraction decoupling protocol logic from the system clock.
//!
//! Grounded on the same "pure logic, real time at the edge" split the rest
//! of the workspace uses: production code calls [`SystemClock`], tests
//! supply a [`FakeClock`] so session timeouts and timebase calculations are
//! deterministic.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

/// Abstract monotonic clock.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Current monotonic instant. Must never go backwards.
    fn now(&self) -> Instant;
}

/// Production clock backed by `std::time::Instant`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Deterministic clock for tests: starts at an arbitrary fixed instant and
/// advances only when told to.
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Arc<Mutex<Instant>>,
}

impl FakeClock {
    /// Creates a clock pinned at the current real instant; only relative
    /// advances via [`FakeClock::advance`] matter to callers.
    #[must_use]
    pub fn new() -> Self {
        Self { now: Arc::new(Mutex::new(Instant::now())) }
    }

    /// Moves the clock forward by `duration`.
    #[allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().expect("FakeClock mutex poisoned");
        *now += duration;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    #[allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]
    fn now(&self) -> Instant {
        *self.now.lock().expect("FakeClock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_only_advances_when_told() {
        let clock = FakeClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), t0 + Duration::from_secs(5));
    }
}
