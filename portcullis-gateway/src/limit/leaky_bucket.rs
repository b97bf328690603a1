//! Leaky-bucket limiting.
//!
//! Each admission adds one unit to a queue that drains continuously at
//! `rate` units per second; requests are denied while the queue is at
//! capacity. Smooths traffic to the leak rate instead of permitting bursts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use portcullis_core::clock::Clock;

use super::{RateDecision, RateLimiter, SWEEP_THRESHOLD};

struct QueueState {
    queued: f64,
    last_leak: u64,
}

pub struct LeakyBucket {
    capacity: f64,
    leak_rate: f64,
    clock: Arc<dyn Clock>,
    queues: DashMap<String, QueueState>,
    last_sweep: AtomicU64,
}

impl LeakyBucket {
    pub fn new(capacity: f64, leak_rate: f64, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity: capacity.max(1.0),
            leak_rate: leak_rate.max(0.001),
            clock,
            queues: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Milliseconds a full queue needs to drain completely.
    fn full_drain_ms(&self) -> u64 {
        (self.capacity / self.leak_rate * 1000.0).ceil() as u64
    }

    fn maybe_sweep(&self, now: u64) {
        if self.queues.len() <= SWEEP_THRESHOLD {
            return;
        }
        let last = self.last_sweep.load(Ordering::Relaxed);
        let period = self.full_drain_ms();
        if now.saturating_sub(last) < period {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.queues
                .retain(|_, queue| queue.last_leak + period > now);
        }
    }
}

impl RateLimiter for LeakyBucket {
    fn name(&self) -> &'static str {
        "leaky_bucket"
    }

    fn consume(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();

        let decision = {
            let mut queue = self.queues.entry(key.to_string()).or_insert(QueueState {
                queued: 0.0,
                last_leak: now,
            });

            let elapsed_secs = now.saturating_sub(queue.last_leak) as f64 / 1000.0;
            queue.queued = (queue.queued - elapsed_secs * self.leak_rate).max(0.0);
            queue.last_leak = now;

            let limit = self.capacity as u64;
            if queue.queued >= self.capacity {
                let wait_secs =
                    ((queue.queued - self.capacity + 1.0) / self.leak_rate).ceil() as u64;
                RateDecision::denied(limit, wait_secs)
            } else {
                queue.queued += 1.0;
                RateDecision::allowed(limit, (self.capacity - queue.queued).floor() as u64)
            }
        };

        self.maybe_sweep(now);
        decision
    }
}
