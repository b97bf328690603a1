//! Weighted round-robin over an expanded rotation.
//!
//! The rotation lists each healthy backend `weight` times, so a cursor walk
//! hands out selections in exact weight proportion. The rotation is rebuilt
//! whenever the healthy set changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::backend::{BackendPool, SharedBackend};

use super::{is_excluded, LoadBalancer};

pub struct WeightedRoundRobin {
    pool: Arc<BackendPool>,
    cursor: AtomicUsize,
    rotation: Mutex<Vec<SharedBackend>>,
}

impl WeightedRoundRobin {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        let balancer = Self {
            pool,
            cursor: AtomicUsize::new(0),
            rotation: Mutex::new(Vec::new()),
        };
        balancer.rebuild();
        balancer
    }

    fn expand(pool: &BackendPool) -> Vec<SharedBackend> {
        pool.healthy()
            .into_iter()
            .flat_map(|backend| {
                let copies = backend.weight() as usize;
                std::iter::repeat(backend).take(copies)
            })
            .collect()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select(&self, _client_key: &str, excluded: &[String]) -> Option<SharedBackend> {
        let rotation = self.rotation.lock().expect("rotation mutex poisoned");
        let eligible: Vec<&SharedBackend> = rotation
            .iter()
            .filter(|backend| backend.is_healthy() && !is_excluded(backend, excluded))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index].clone())
    }

    fn rebuild(&self) {
        let expanded = Self::expand(&self.pool);
        debug!(slots = expanded.len(), "rebuilt weighted rotation");
        *self.rotation.lock().expect("rotation mutex poisoned") = expanded;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::pool;
    use super::*;

    #[test]
    fn selections_follow_weight_proportions() {
        let pool = pool(&[("a", 1, 3), ("b", 2, 2), ("c", 3, 1)]);
        let balancer = WeightedRoundRobin::new(pool);

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select("client", &[]).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, ["a", "a", "a", "b", "b", "c"]);
    }

    #[test]
    fn proportions_hold_over_repeated_cycles() {
        let pool = pool(&[("a", 1, 3), ("b", 2, 2), ("c", 3, 1)]);
        let balancer = WeightedRoundRobin::new(pool);

        let mut counts = std::collections::HashMap::new();
        for _ in 0..60 {
            let name = balancer.select("client", &[]).unwrap().name().to_string();
            *counts.entry(name).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 30);
        assert_eq!(counts["b"], 20);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn rebuild_drops_toggled_backends_from_the_rotation() {
        let pool = pool(&[("a", 1, 3), ("b", 2, 1)]);
        let balancer = WeightedRoundRobin::new(pool.clone());

        pool.get("a").unwrap().set_healthy(false);
        balancer.rebuild();

        for _ in 0..4 {
            assert_eq!(balancer.select("client", &[]).unwrap().name(), "b");
        }
    }

    #[test]
    fn exclusion_filters_the_rotation_without_rebuilding() {
        let pool = pool(&[("a", 1, 2), ("b", 2, 1)]);
        let balancer = WeightedRoundRobin::new(pool);
        let excluded = vec!["a".to_string()];

        for _ in 0..3 {
            assert_eq!(balancer.select("client", &excluded).unwrap().name(), "b");
        }
    }
}
