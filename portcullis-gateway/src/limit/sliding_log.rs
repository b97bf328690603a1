//! Sliding-log limiting: an exact trailing-window count.
//!
//! Remembers every admitted request timestamp inside the window, so memory
//! is O(requests per window) per key, in exchange for no boundary artefacts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use portcullis_core::clock::Clock;

use super::{ceil_secs, RateDecision, RateLimiter, SWEEP_THRESHOLD};

pub struct SlidingLog {
    max_requests: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    logs: DashMap<String, VecDeque<u64>>,
    last_sweep: AtomicU64,
}

impl SlidingLog {
    pub fn new(max_requests: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window_ms: window_ms.max(1),
            clock,
            logs: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    fn maybe_sweep(&self, now: u64) {
        if self.logs.len() <= SWEEP_THRESHOLD {
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
            let window_ms = self.window_ms;
            self.logs
                .retain(|_, log| log.back().is_some_and(|&newest| newest + window_ms > now));
        }
    }
}

impl RateLimiter for SlidingLog {
    fn name(&self) -> &'static str {
        "sliding_log"
    }

    fn consume(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();

        let decision = {
            let mut log = self.logs.entry(key.to_string()).or_default();
            while log
                .front()
                .is_some_and(|&oldest| oldest + self.window_ms <= now)
            {
                log.pop_front();
            }

            if log.len() as u64 >= self.max_requests {
                // The budget frees up when the oldest retained entry expires.
                let wait = log
                    .front()
                    .map(|&oldest| (oldest + self.window_ms).saturating_sub(now))
                    .unwrap_or(self.window_ms);
                RateDecision::denied(self.max_requests, ceil_secs(wait))
            } else {
                log.push_back(now);
                RateDecision::allowed(self.max_requests, self.max_requests - log.len() as u64)
            }
        };

        self.maybe_sweep(now);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_core::clock::ManualClock;

    fn limiter(max: u64, window_ms: u64) -> (SlidingLog, ManualClock) {
        let clock = ManualClock::new();
        let limiter = SlidingLog::new(max, window_ms, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn admits_up_to_the_ceiling_then_denies() {
        let (limiter, _clock) = limiter(3, 10_000);
        assert_eq!(limiter.consume("client").remaining, 2);
        assert_eq!(limiter.consume("client").remaining, 1);
        assert_eq!(limiter.consume("client").remaining, 0);
        assert!(!limiter.consume("client").allowed);
    }

    #[test]
    fn retry_after_tracks_the_oldest_entry() {
        let (limiter, clock) = limiter(2, 10_000);
        limiter.consume("client");
        clock.advance(4_000);
        limiter.consume("client");
        let denied = limiter.consume("client");
        assert!(!denied.allowed);
        // Oldest entry at t=0 expires at t=10000, 6s away from t=4000.
        assert_eq!(denied.retry_after, Some(6));
    }

    #[test]
    fn window_slides_rather_than_resets() {
        let (limiter, clock) = limiter(2, 10_000);
        limiter.consume("client");
        clock.advance(6_000);
        limiter.consume("client");
        clock.advance(5_000); // t=11000: the t=0 entry has expired, t=6000 has not
        let decision = limiter.consume("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert!(!limiter.consume("client").allowed);
    }

    #[test]
    fn idle_interval_restores_full_capacity() {
        let (limiter, clock) = limiter(2, 10_000);
        limiter.consume("client");
        limiter.consume("client");
        clock.advance(10_001);
        assert_eq!(limiter.consume("client").remaining, 1);
    }
}
