//! Clock abstraction used by the rate limiters, circuit breakers and the
//! request pipeline so that all time arithmetic can be driven by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Thread-safe time source measured in milliseconds.
///
/// The origin is implementation-defined; only differences between readings
/// are meaningful. Calls must be safe concurrently.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds relative to the implementer's origin.
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `Instant::now()`.
///
/// Clones share the same epoch (the instant captured at creation); readings
/// from independently created instances are not comparable.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock advanced by hand, for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock at an arbitrary offset.
    pub fn at(millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn monotonic_non_decreasing() {
        let clock = MonotonicClock::new();
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
    }

    #[test]
    fn clones_share_epoch() {
        let clock = MonotonicClock::new();
        let clone = clock.clone();
        thread::sleep(Duration::from_millis(5));
        let diff = clock.now_millis().abs_diff(clone.now_millis());
        assert!(diff < 50, "clones differ by {}ms", diff);
    }

    #[test]
    fn manual_clock_advances_all_handles() {
        let clock = ManualClock::new();
        let clone = clock.clone();
        clock.advance(250);
        assert_eq!(clone.now_millis(), 250);
    }

    #[test]
    fn trait_object_usage() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at(42));
        assert_eq!(clock.now_millis(), 42);
    }
}
