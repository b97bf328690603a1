//! Upstream backend identities and the fixed pool built at startup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::BackendConfig;

/// One interchangeable upstream service instance.
///
/// Identity (name, host, port) and weight are fixed for the lifetime of the
/// process; only the healthy flag is mutable, and it is readable lock-free
/// from the selection hot path.
#[derive(Debug)]
pub struct Backend {
    name: String,
    host: String,
    port: u16,
    weight: u32,
    healthy: AtomicBool,
}

pub type SharedBackend = Arc<Backend>;

impl Backend {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            weight: config.weight.max(1),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// `host:port`, used as the upstream authority and as the key for
    /// per-backend counters.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }
}

/// The ordered, fixed set of targets the gateway balances over.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<SharedBackend>,
}

impl BackendPool {
    pub fn new(configs: &[BackendConfig]) -> Self {
        Self {
            backends: configs
                .iter()
                .map(|config| Arc::new(Backend::new(config)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn all(&self) -> &[SharedBackend] {
        &self.backends
    }

    /// Healthy backends in registration order.
    pub fn healthy(&self) -> Vec<SharedBackend> {
        self.backends
            .iter()
            .filter(|backend| backend.is_healthy())
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&SharedBackend> {
        self.backends.iter().find(|backend| backend.name() == name)
    }
}
