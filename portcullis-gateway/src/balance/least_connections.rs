//! Least-connections: route to the backend with the fewest in-flight
//! requests, first wins on ties.
//!
//! Selection increments the chosen backend's active count; the pipeline
//! guarantees a matching `completed` on every terminal path via
//! `CompletionGuard`. Counts are keyed by authority and clamped at zero.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, BackendPool, SharedBackend};

use super::{is_excluded, LoadBalancer};

pub struct LeastConnections {
    pool: Arc<BackendPool>,
    active: Mutex<HashMap<String, u64>>,
}

impl LeastConnections {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            active: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn active_count(&self, backend: &Backend) -> u64 {
        self.active
            .lock()
            .expect("active map poisoned")
            .get(&backend.authority())
            .copied()
            .unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, _client_key: &str, excluded: &[String]) -> Option<SharedBackend> {
        let mut active = self.active.lock().expect("active map poisoned");

        let chosen = self
            .pool
            .healthy()
            .into_iter()
            .filter(|backend| !is_excluded(backend, excluded))
            .min_by_key(|backend| active.get(&backend.authority()).copied().unwrap_or(0))?;

        *active.entry(chosen.authority()).or_insert(0) += 1;
        Some(chosen)
    }

    fn completed(&self, backend: &Backend) {
        let mut active = self.active.lock().expect("active map poisoned");
        let count = active.entry(backend.authority()).or_insert(0);
        *count = count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::pool;
    use super::*;

    #[test]
    fn first_backend_wins_ties() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1)]);
        let balancer = LeastConnections::new(pool);
        assert_eq!(balancer.select("client", &[]).unwrap().name(), "a");
    }

    #[test]
    fn routes_to_the_least_loaded_backend() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]);
        let balancer = LeastConnections::new(pool);

        // Three in-flight selections land on distinct backends.
        let picks: Vec<String> = (0..3)
            .map(|_| balancer.select("client", &[]).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c"]);
    }

    #[test]
    fn completion_frees_a_slot() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1)]);
        let balancer = LeastConnections::new(pool.clone());

        let first = balancer.select("client", &[]).unwrap();
        let _second = balancer.select("client", &[]).unwrap();
        balancer.completed(&first);

        // `a` is free again and wins the tie-less comparison.
        assert_eq!(balancer.select("client", &[]).unwrap().name(), "a");
    }

    #[test]
    fn counts_never_go_negative() {
        let pool = pool(&[("a", 1, 1)]);
        let balancer = LeastConnections::new(pool.clone());
        let backend = pool.all()[0].clone();

        balancer.completed(&backend);
        balancer.completed(&backend);
        assert_eq!(balancer.active_count(&backend), 0);

        let selected = balancer.select("client", &[]).unwrap();
        assert_eq!(balancer.active_count(&selected), 1);
    }

    #[test]
    fn every_select_pairs_with_one_completed() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1)]);
        let balancer = LeastConnections::new(pool.clone());

        let mut selected = Vec::new();
        for _ in 0..10 {
            selected.push(balancer.select("client", &[]).unwrap());
        }
        for backend in &selected {
            balancer.completed(backend);
        }

        for backend in pool.all() {
            assert_eq!(balancer.active_count(backend), 0);
        }
    }
}
