//! Plain round-robin: a monotonic cursor over the healthy set, weights
//! ignored.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::backend::{BackendPool, SharedBackend};

use super::{is_excluded, LoadBalancer};

pub struct RoundRobin {
    pool: Arc<BackendPool>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self {
            pool,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, _client_key: &str, excluded: &[String]) -> Option<SharedBackend> {
        let eligible: Vec<SharedBackend> = self
            .pool
            .healthy()
            .into_iter()
            .filter(|backend| !is_excluded(backend, excluded))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % eligible.len();
        Some(eligible[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::pool;
    use super::*;

    #[test]
    fn cycles_evenly_over_the_healthy_set() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]);
        let balancer = RoundRobin::new(pool);

        let picks: Vec<String> = (0..6)
            .map(|_| balancer.select("client", &[]).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn skips_unhealthy_backends() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1), ("c", 3, 1)]);
        pool.get("b").unwrap().set_healthy(false);
        let balancer = RoundRobin::new(pool);

        let picks: Vec<String> = (0..4)
            .map(|_| balancer.select("client", &[]).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, ["a", "c", "a", "c"]);
    }

    #[test]
    fn skips_excluded_backends() {
        let pool = pool(&[("a", 1, 1), ("b", 2, 1)]);
        let balancer = RoundRobin::new(pool);
        let excluded = vec!["a".to_string()];

        for _ in 0..3 {
            assert_eq!(
                balancer.select("client", &excluded).unwrap().name(),
                "b"
            );
        }
    }

    #[test]
    fn returns_none_when_nothing_is_eligible() {
        let pool = pool(&[("a", 1, 1)]);
        pool.get("a").unwrap().set_healthy(false);
        let balancer = RoundRobin::new(pool);
        assert!(balancer.select("client", &[]).is_none());
    }
}
