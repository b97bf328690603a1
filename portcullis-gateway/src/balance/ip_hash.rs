//! IP-hash: a deterministic client-key hash reduced over the healthy set.
//!
//! The same client key maps to the same backend for as long as the healthy
//! set is unchanged; any membership change may remap every key (the
//! consistent-hash balancer exists to avoid exactly that).

use std::sync::Arc;

use crate::backend::{BackendPool, SharedBackend};

use super::hashing::rolling_hash;
use super::{is_excluded, LoadBalancer};

pub struct IpHash {
    pool: Arc<BackendPool>,
}

impl IpHash {
    pub fn new(pool: Arc<BackendPool>) -> Self {
        Self { pool }
    }
}

impl LoadBalancer for IpHash {
    fn name(&self) -> &'static str {
        "ip_hash"
    }

    fn select(&self, client_key: &str, excluded: &[String]) -> Option<SharedBackend> {
        let eligible: Vec<SharedBackend> = self
            .pool
            .healthy()
            .into_iter()
            .filter(|backend| !is_excluded(backend, excluded))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let index = rolling_hash(client_key) as usize % eligible.len();
        Some(eligible[index].clone())
    }
}
