//! Rate limiting: one uniform contract, five interchangeable algorithms.
//!
//! Every limiter partitions its state by an opaque client key and decides
//! allow/deny synchronously; decisions surface the advisory `limit` and
//! `remaining` values verbatim in the `X-RateLimit-*` response headers.
//! Algorithms never share state and are independently selectable at runtime
//! through the control surface.

mod fixed_window;
mod leaky_bucket;
mod sliding_counter;
mod sliding_log;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_counter::SlidingCounter;
pub use sliding_log::SlidingLog;
pub use token_bucket::TokenBucket;

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// The ceiling the algorithm enforces, surfaced as `X-RateLimit-Limit`.
    pub limit: u64,
    /// Remaining budget after this call; 0 when denied.
    pub remaining: u64,
    /// Whole seconds until a retry may succeed; present iff denied, >= 1.
    pub retry_after: Option<u64>,
}

impl RateDecision {
    pub fn allowed(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after: None,
        }
    }

    pub fn denied(limit: u64, retry_after: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after: Some(retry_after.max(1)),
        }
    }
}

/// Contract every limiter implements. `consume` must be callable from many
/// request handlers concurrently and must not block on I/O.
pub trait RateLimiter: Send + Sync {
    /// Registry key used by the control surface and response headers.
    fn name(&self) -> &'static str;

    fn consume(&self, key: &str) -> RateDecision;
}

/// Per-key maps are swept opportunistically rather than capped: once a map
/// holds more keys than this, the owning limiter drops entries that can no
/// longer influence a decision, at most once per window/drain period.
pub(crate) const SWEEP_THRESHOLD: usize = 1024;

/// Millisecond quantities rounded up to whole seconds for `Retry-After`.
pub(crate) fn ceil_secs(millis: u64) -> u64 {
    millis.div_ceil(1000).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_decisions_clamp_retry_after_to_one() {
        let decision = RateDecision::denied(10, 0);
        assert_eq!(decision.retry_after, Some(1));
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(1), 1);
        assert_eq!(ceil_secs(1000), 1);
        assert_eq!(ceil_secs(1001), 2);
        assert_eq!(ceil_secs(0), 1);
    }
}
