//! Sliding-counter limiting: fixed-window cost with an interpolated edge.
//!
//! Keeps the current and previous aligned window counters per key and
//! estimates the trailing-window usage as
//! `floor(previous * (1 - elapsed/W)) + current`, which smooths the
//! boundary burst of plain fixed windows without remembering timestamps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use portcullis_core::clock::Clock;

use super::{ceil_secs, RateDecision, RateLimiter, SWEEP_THRESHOLD};

struct Counters {
    index: u64,
    current: u64,
    previous: u64,
}

pub struct SlidingCounter {
    max_requests: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    counters: DashMap<String, Counters>,
    last_sweep: AtomicU64,
}

impl SlidingCounter {
    pub fn new(max_requests: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window_ms: window_ms.max(1),
            clock,
            counters: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    fn maybe_sweep(&self, now: u64, current_index: u64) {
        if self.counters.len() <= SWEEP_THRESHOLD {
            return;
        }
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.window_ms {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            // Entries older than the previous window no longer contribute.
            self.counters
                .retain(|_, counters| counters.index + 1 >= current_index);
        }
    }
}

impl RateLimiter for SlidingCounter {
    fn name(&self) -> &'static str {
        "sliding_counter"
    }

    fn consume(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();
        let index = now / self.window_ms;

        let decision = {
            let mut entry = self.counters.entry(key.to_string()).or_insert(Counters {
                index,
                current: 0,
                previous: 0,
            });

            if entry.index != index {
                entry.previous = if entry.index + 1 == index {
                    entry.current
                } else {
                    0
                };
                entry.current = 0;
                entry.index = index;
            }

            let elapsed = now - index * self.window_ms;
            let prev_weight = 1.0 - elapsed as f64 / self.window_ms as f64;
            let estimate = (entry.previous as f64 * prev_weight).floor() as u64 + entry.current;

            if estimate >= self.max_requests {
                RateDecision::denied(self.max_requests, ceil_secs(self.window_ms - elapsed))
            } else {
                entry.current += 1;
                RateDecision::allowed(self.max_requests, self.max_requests - estimate - 1)
            }
        };

        self.maybe_sweep(now, index);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_core::clock::ManualClock;

    fn limiter(max: u64, window_ms: u64) -> (SlidingCounter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = SlidingCounter::new(max, window_ms, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn behaves_like_fixed_window_with_no_history() {
        let (limiter, _clock) = limiter(3, 10_000);
        assert_eq!(limiter.consume("client").remaining, 2);
        assert_eq!(limiter.consume("client").remaining, 1);
        assert_eq!(limiter.consume("client").remaining, 0);
        let denied = limiter.consume("client");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(10));
    }

    #[test]
    fn previous_window_weighs_into_the_estimate() {
        let (limiter, clock) = limiter(4, 10_000);
        for _ in 0..4 {
            assert!(limiter.consume("client").allowed);
        }
        // 2.5s into the next window: estimate = floor(4 * 0.75) = 3.
        clock.advance(12_500);
        let decision = limiter.consume("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.consume("client").allowed);
    }

    #[test]
    fn previous_window_fades_as_the_window_ages() {
        let (limiter, clock) = limiter(4, 10_000);
        for _ in 0..4 {
            limiter.consume("client");
        }
        // 9s into the next window: estimate = floor(4 * 0.1) = 0.
        clock.advance(19_000);
        let decision = limiter.consume("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }

    #[test]
    fn a_skipped_window_clears_history() {
        let (limiter, clock) = limiter(2, 10_000);
        limiter.consume("client");
        limiter.consume("client");
        clock.advance(25_000); // two windows later
        let decision = limiter.consume("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn denial_reports_time_to_the_window_edge() {
        let (limiter, clock) = limiter(1, 10_000);
        limiter.consume("client");
        clock.advance(4_200);
        let denied = limiter.consume("client");
        assert!(!denied.allowed);
        // 5800ms left in the window, rounded up.
        assert_eq!(denied.retry_after, Some(6));
    }
}
