//! Process-wide request counters, reset only through the control surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    total_requests: AtomicU64,
    rate_limited: AtomicU64,
    circuit_broken: AtomicU64,
    proxied: AtomicU64,
    errors: AtomicU64,
    by_backend: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub rate_limited: u64,
    pub circuit_broken: u64,
    pub proxied: u64,
    pub errors: u64,
    pub by_backend: HashMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_total(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_circuit_broken(&self) {
        self.circuit_broken.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxied(&self, backend_name: &str) {
        self.proxied.fetch_add(1, Ordering::Relaxed);
        let mut by_backend = self.by_backend.lock().expect("metrics mutex poisoned");
        *by_backend.entry(backend_name.to_string()).or_insert(0) += 1;
    }

    pub fn backend_count(&self, backend_name: &str) -> u64 {
        self.by_backend
            .lock()
            .expect("metrics mutex poisoned")
            .get(backend_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_broken: self.circuit_broken.load(Ordering::Relaxed),
            proxied: self.proxied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            by_backend: self
                .by_backend
                .lock()
                .expect("metrics mutex poisoned")
                .clone(),
        }
    }

    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.rate_limited.store(0, Ordering::Relaxed);
        self.circuit_broken.store(0, Ordering::Relaxed);
        self.proxied.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.by_backend
            .lock()
            .expect("metrics mutex poisoned")
            .clear();
    }
}
