//! Load balancing: one uniform contract, five interchangeable algorithms.
//!
//! `select` returns only healthy backends, skipping any whose name appears
//! in the exclusion list (backends whose breaker already refused this
//! request), so deterministic algorithms fail over instead of re-nominating
//! the same refused target. Algorithms that cache derived structures (the
//! weighted rotation, the hash ring) refresh them in `rebuild`, which the
//! control surface invokes whenever a healthy flag changes.

pub mod hashing;

mod consistent_hash;
mod ip_hash;
mod least_connections;
mod round_robin;
mod weighted_round_robin;

pub use consistent_hash::ConsistentHash;
pub use ip_hash::IpHash;
pub use least_connections::LeastConnections;
pub use round_robin::RoundRobin;
pub use weighted_round_robin::WeightedRoundRobin;

use std::sync::Arc;

use crate::backend::{Backend, SharedBackend};

pub trait LoadBalancer: Send + Sync {
    /// Registry key used by the control surface and response headers.
    fn name(&self) -> &'static str;

    /// Chooses a healthy backend for the request, or `None` when every
    /// eligible backend is unhealthy or excluded.
    fn select(&self, client_key: &str, excluded: &[String]) -> Option<SharedBackend>;

    /// Completion hook paired with `select`; balancers that track in-flight
    /// work (least-connections) decrement here.
    fn completed(&self, _backend: &Backend) {}

    /// Re-derives any cached view of the backend pool after a healthy flag
    /// change.
    fn rebuild(&self) {}
}

/// Pairs every admitted `select` with exactly one `completed` call.
///
/// The guard travels with the request context; dropping it releases the
/// balancer hook, whether the drop happens on upstream completion, on a
/// stage error, or because the client disconnected and the request future
/// was cancelled.
pub struct CompletionGuard {
    balancer: Arc<dyn LoadBalancer>,
    backend: SharedBackend,
}

impl CompletionGuard {
    pub fn new(balancer: Arc<dyn LoadBalancer>, backend: SharedBackend) -> Self {
        Self { balancer, backend }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.balancer.completed(&self.backend);
    }
}

pub(crate) fn is_excluded(backend: &Backend, excluded: &[String]) -> bool {
    excluded.iter().any(|name| name == backend.name())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::backend::BackendPool;
    use crate::config::BackendConfig;

    pub fn pool(entries: &[(&str, u16, u32)]) -> Arc<BackendPool> {
        let configs: Vec<BackendConfig> = entries
            .iter()
            .map(|(name, port, weight)| BackendConfig {
                name: (*name).to_string(),
                host: "127.0.0.1".to_string(),
                port: *port,
                weight: *weight,
            })
            .collect();
        Arc::new(BackendPool::new(&configs))
    }
}
