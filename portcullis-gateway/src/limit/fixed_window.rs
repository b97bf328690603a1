//! Fixed-window counting.
//!
//! Time is partitioned into aligned windows of length W; each key gets one
//! counter per window. Cheapest of the window algorithms, with the classic
//! boundary-burst weakness: a client can spend its full budget at the end of
//! one window and again at the start of the next, so up to 2x the limit can
//! land inside any W-long span straddling a boundary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use portcullis_core::clock::Clock;

use super::{ceil_secs, RateDecision, RateLimiter, SWEEP_THRESHOLD};

struct Window {
    index: u64,
    count: u64,
}

pub struct FixedWindow {
    max_requests: u64,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    windows: DashMap<String, Window>,
    last_sweep: AtomicU64,
}

impl FixedWindow {
    pub fn new(max_requests: u64, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_requests,
            window_ms: window_ms.max(1),
            clock,
            windows: DashMap::new(),
            last_sweep: AtomicU64::new(0),
        }
    }

    fn maybe_sweep(&self, now: u64, current_index: u64) {
        if self.windows.len() <= SWEEP_THRESHOLD {
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
            self.windows.retain(|_, window| window.index >= current_index);
        }
    }
}

impl RateLimiter for FixedWindow {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn consume(&self, key: &str) -> RateDecision {
        let now = self.clock.now_millis();
        let index = now / self.window_ms;

        let decision = {
            let mut entry = self
                .windows
                .entry(key.to_string())
                .or_insert(Window { index, count: 0 });
            if entry.index != index {
                *entry = Window { index, count: 0 };
            }
            entry.count += 1;

            if entry.count > self.max_requests {
                let expiry = (index + 1) * self.window_ms;
                RateDecision::denied(self.max_requests, ceil_secs(expiry.saturating_sub(now)))
            } else {
                RateDecision::allowed(self.max_requests, self.max_requests - entry.count)
            }
        };

        self.maybe_sweep(now, index);
        decision
    }
}
