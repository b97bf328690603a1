//! Named registries for the algorithm families and the atomically
//! swappable "active" pair consulted on the request hot path.

use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::info;

use crate::balance::LoadBalancer;
use crate::limit::RateLimiter;

#[derive(Debug, Error)]
#[error("unknown algorithm: {0}")]
pub struct UnknownAlgorithm(pub String);

/// The pair of algorithms currently serving requests. Swapped wholesale so
/// every reader observes a consistent combination.
pub struct ActiveSelection {
    pub limiter: Arc<dyn RateLimiter>,
    pub balancer: Arc<dyn LoadBalancer>,
}

pub struct AlgorithmRegistry {
    limiters: Vec<Arc<dyn RateLimiter>>,
    balancers: Vec<Arc<dyn LoadBalancer>>,
    active: ArcSwap<ActiveSelection>,
}

impl AlgorithmRegistry {
    pub fn new(
        limiters: Vec<Arc<dyn RateLimiter>>,
        balancers: Vec<Arc<dyn LoadBalancer>>,
        default_limiter: &str,
        default_balancer: &str,
    ) -> Result<Self, UnknownAlgorithm> {
        let limiter = find_limiter(&limiters, default_limiter)?;
        let balancer = find_balancer(&balancers, default_balancer)?;

        Ok(Self {
            limiters,
            balancers,
            active: ArcSwap::from_pointee(ActiveSelection { limiter, balancer }),
        })
    }

    /// The current pair; callers hold the returned `Arc` for the duration of
    /// one request so mid-request swaps cannot split a decision.
    pub fn active(&self) -> Arc<ActiveSelection> {
        self.active.load_full()
    }

    pub fn set_limiter(&self, name: &str) -> Result<Arc<dyn RateLimiter>, UnknownAlgorithm> {
        let limiter = find_limiter(&self.limiters, name)?;
        let swapped = limiter.clone();
        self.active.rcu(move |current| ActiveSelection {
            limiter: limiter.clone(),
            balancer: current.balancer.clone(),
        });
        info!(algorithm = name, "rate limiter switched");
        Ok(swapped)
    }

    pub fn set_balancer(&self, name: &str) -> Result<Arc<dyn LoadBalancer>, UnknownAlgorithm> {
        let balancer = find_balancer(&self.balancers, name)?;
        let swapped = balancer.clone();
        self.active.rcu(move |current| ActiveSelection {
            limiter: current.limiter.clone(),
            balancer: balancer.clone(),
        });
        info!(algorithm = name, "load balancer switched");
        Ok(swapped)
    }

    pub fn limiter_names(&self) -> Vec<&'static str> {
        self.limiters.iter().map(|limiter| limiter.name()).collect()
    }

    pub fn balancer_names(&self) -> Vec<&'static str> {
        self.balancers
            .iter()
            .map(|balancer| balancer.name())
            .collect()
    }

    /// Propagates a healthy-set change to every registered balancer.
    pub fn rebuild_balancers(&self) {
        for balancer in &self.balancers {
            balancer.rebuild();
        }
    }
}

fn find_limiter(
    limiters: &[Arc<dyn RateLimiter>],
    name: &str,
) -> Result<Arc<dyn RateLimiter>, UnknownAlgorithm> {
    limiters
        .iter()
        .find(|limiter| limiter.name() == name)
        .cloned()
        .ok_or_else(|| UnknownAlgorithm(name.to_string()))
}

fn find_balancer(
    balancers: &[Arc<dyn LoadBalancer>],
    name: &str,
) -> Result<Arc<dyn LoadBalancer>, UnknownAlgorithm> {
    balancers
        .iter()
        .find(|balancer| balancer.name() == name)
        .cloned()
        .ok_or_else(|| UnknownAlgorithm(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SharedBackend;
    use crate::limit::RateDecision;

    struct StubLimiter(&'static str);

    impl RateLimiter for StubLimiter {
        fn name(&self) -> &'static str {
            self.0
        }

        fn consume(&self, _key: &str) -> RateDecision {
            RateDecision::allowed(1, 1)
        }
    }

    struct StubBalancer(&'static str);

    impl LoadBalancer for StubBalancer {
        fn name(&self) -> &'static str {
            self.0
        }

        fn select(&self, _key: &str, _excluded: &[String]) -> Option<SharedBackend> {
            None
        }
    }

    fn registry() -> AlgorithmRegistry {
        AlgorithmRegistry::new(
            vec![Arc::new(StubLimiter("one")), Arc::new(StubLimiter("two"))],
            vec![
                Arc::new(StubBalancer("left")),
                Arc::new(StubBalancer("right")),
            ],
            "one",
            "left",
        )
        .expect("defaults are registered")
    }

    #[test]
    fn defaults_resolve_to_registered_instances() {
        let registry = registry();
        let active = registry.active();
        assert_eq!(active.limiter.name(), "one");
        assert_eq!(active.balancer.name(), "left");
    }

    #[test]
    fn swapping_one_side_preserves_the_other() {
        let registry = registry();
        registry.set_limiter("two").expect("registered");
        let active = registry.active();
        assert_eq!(active.limiter.name(), "two");
        assert_eq!(active.balancer.name(), "left");

        registry.set_balancer("right").expect("registered");
        let active = registry.active();
        assert_eq!(active.limiter.name(), "two");
        assert_eq!(active.balancer.name(), "right");
    }

    #[test]
    fn unknown_names_are_rejected() {
        let registry = registry();
        assert!(registry.set_limiter("nope").is_err());
        assert!(registry.set_balancer("nope").is_err());
        assert!(AlgorithmRegistry::new(vec![Arc::new(StubLimiter("one"))], vec![], "one", "left")
            .is_err());
    }

    #[test]
    fn registry_lists_names_in_registration_order() {
        let registry = registry();
        assert_eq!(registry.limiter_names(), ["one", "two"]);
        assert_eq!(registry.balancer_names(), ["left", "right"]);
    }
}
