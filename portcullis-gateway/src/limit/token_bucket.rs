//! Token-bucket limiting.
//!
//! Buckets start full, refill continuously at `rate` tokens per second and
//! cap at `capacity`; each admission spends one token. The only algorithm
//! here that deliberately permits bursts up to the full capacity.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use portcullis_core::clock::Clock;

use super::{RateDecision, RateLimiter, SWEEP_THRESHOLD};

struct BucketState {
    tokens: f64,
    last_refill: u64,
}

pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    clock: Arc<dyn Clock>,
    buckets: DashMap<String, BucketState>,
    last_sweep: AtomicU64,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1.0),
            refill_rate: refill_rate.max(0.001),
            clock,
            buckets: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Milliseconds an untouched bucket needs to refill completely; entries
    /// idle at least this long behave exactly like fresh keys.
    fn full_refill_ms(&self) -> u64 {
        (self.capacity / self.refill_rate * 1000.0).ceil() as u64
    }

    fn maybe_sweep(&self, now: u64) {
        if self.buckets.len() <= SWEEP_THRESHOLD {
            return;
        }
        let last = self.last_sweep.load(Ordering::Relaxed);
        let period = self.full_refill_ms();
        if now.saturating_sub(last) < period {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.buckets
                .retain(|_, bucket| bucket.last_refill + period > now);
        }
    }
}

impl RateLimiter for TokenBucket {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn consume(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();

        let decision = {
            let mut bucket = self.buckets.entry(key.to_string()).or_insert(BucketState {
                tokens: self.capacity,
                last_refill: now,
            });

            let elapsed_secs = now.saturating_sub(bucket.last_refill) as f64 / 1000.0;
            bucket.tokens = (bucket.tokens + elapsed_secs * self.refill_rate).min(self.capacity);
            bucket.last_refill = now;

            let limit = self.capacity as u64;
            if bucket.tokens < 1.0 {
                let wait_secs = ((1.0 - bucket.tokens) / self.refill_rate).ceil() as u64;
                RateDecision::denied(limit, wait_secs)
            } else {
                bucket.tokens -= 1.0;
                RateDecision::allowed(limit, bucket.tokens.floor() as u64)
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

    fn limiter(capacity: f64, rate: f64) -> (TokenBucket, ManualClock) {
        let clock = ManualClock::new();
        let limiter = TokenBucket::new(capacity, rate, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn fresh_bucket_allows_a_full_burst() {
        let (limiter, _clock) = limiter(20.0, 5.0);
        for expected_remaining in (0..20).rev() {
            let decision = limiter.consume("client");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.consume("client");
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));
    }

    #[test]
    fn refill_restores_tokens_over_time() {
        let (limiter, clock) = limiter(5.0, 5.0);
        for _ in 0..5 {
            limiter.consume("client");
        }
        assert!(!limiter.consume("client").allowed);
        clock.advance(200); // one token at 5/s
        assert!(limiter.consume("client").allowed);
        assert!(!limiter.consume("client").allowed);
    }

    #[test]
    fn refill_caps_at_capacity() {
        let (limiter, clock) = limiter(3.0, 5.0);
        limiter.consume("client");
        clock.advance(60_000);
        let decision = limiter.consume("client");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[test]
    fn retry_after_scales_with_the_deficit() {
        let (limiter, _clock) = limiter(1.0, 0.5);
        assert!(limiter.consume("client").allowed);
        let denied = limiter.consume("client");
        // One token at 0.5/s is two seconds away.
        assert_eq!(denied.retry_after, Some(2));
    }
}
