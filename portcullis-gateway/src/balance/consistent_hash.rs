//! Consistent hashing with virtual nodes.
//!
//! Each healthy backend contributes `virtual_nodes` positions on a 32-bit
//! FNV-1a ring; a key is served by the owner of the first position at or
//! after its hash, wrapping at the end. Removing one of N backends then
//! displaces only the keys that pointed at its positions, roughly 1/N of
//! them. Excluded owners are skipped by walking the ring clockwise.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::backend::{BackendPool, SharedBackend};

use super::hashing::fnv1a;
use super::{is_excluded, LoadBalancer};

pub struct ConsistentHash {
    pool: Arc<BackendPool>,
    virtual_nodes: usize,
    ring: Mutex<Vec<(u32, SharedBackend)>>,
}

impl ConsistentHash {
    pub fn new(pool: Arc<BackendPool>, virtual_nodes: usize) -> Self {
        let balancer = Self {
            pool,
            virtual_nodes: virtual_nodes.max(1),
            ring: Mutex::new(Vec::new()),
        };
        balancer.rebuild();
        balancer
    }

    fn build_ring(&self) -> Vec<(u32, SharedBackend)> {
        let mut ring: Vec<(u32, SharedBackend)> = self
            .pool
            .healthy()
            .into_iter()
            .flat_map(|backend| {
                let authority = backend.authority();
                (0..self.virtual_nodes)
                    .map(move |vnode| (fnv1a(&format!("{authority}:vnode{vnode}")), backend.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        ring.sort_by_key(|(position, _)| *position);
        ring
    }
}

impl LoadBalancer for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn select(&self, client_key: &str, excluded: &[String]) -> Option<SharedBackend> {
        let ring = self.ring.lock().expect("ring mutex poisoned");
        if ring.is_empty() {
            return None;
        }

        let hash = fnv1a(client_key);
        let start = ring.partition_point(|(position, _)| *position < hash);

        // Clockwise walk from the owning position, skipping entries whose
        // backend has been excluded or toggled since the last rebuild.
        for offset in 0..ring.len() {
            let (_, backend) = &ring[(start + offset) % ring.len()];
            if backend.is_healthy() && !is_excluded(backend, excluded) {
                return Some(backend.clone());
            }
        }
        None
    }

    fn rebuild(&self) {
        let ring = self.build_ring();
        debug!(positions = ring.len(), "rebuilt consistent-hash ring");
        *self.ring.lock().expect("ring mutex poisoned") = ring;
    }
}
