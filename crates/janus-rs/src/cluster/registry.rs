//! Ready-worker registry and request scheduling.
//!
//! The supervisor owns mutation; request tasks read a snapshot of the
//! bridge list. Only bridges that are alive and have completed their
//! WORKER_READY handshake are eligible for dispatch.

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::ipc::WorkerBridge;
use crate::models::settings::ClusterStrategy;

/// The scheduling view over the worker pool.
pub struct WorkerRegistry {
    strategy: ClusterStrategy,
    bridges: RwLock<Vec<WorkerBridge>>,
    rr_counter: AtomicUsize,
}

impl WorkerRegistry {
    pub fn new(strategy: ClusterStrategy) -> Self {
        Self {
            strategy,
            bridges: RwLock::new(Vec::new()),
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// Installs (or replaces) the bridge for a worker id.
    pub fn install(&self, bridge: WorkerBridge) {
        let mut bridges = self.bridges.write();
        if let Some(slot) = bridges
            .iter_mut()
            .find(|b| b.worker_id() == bridge.worker_id())
        {
            *slot = bridge;
        } else {
            bridges.push(bridge);
        }
    }

    pub fn remove(&self, worker_id: u32) {
        self.bridges.write().retain(|b| b.worker_id() != worker_id);
    }

    /// Copy-on-read snapshot of dispatchable workers.
    pub fn ready(&self) -> Vec<WorkerBridge> {
        self.bridges
            .read()
            .iter()
            .filter(|b| b.is_alive() && b.is_ready())
            .cloned()
            .collect()
    }

    pub fn ready_count(&self) -> usize {
        self.ready().len()
    }

    /// Outstanding requests across all live bridges.
    pub fn total_in_flight(&self) -> u64 {
        self.bridges.read().iter().map(|b| b.in_flight()).sum()
    }

    /// All bridges, for drain broadcast.
    pub fn all(&self) -> Vec<WorkerBridge> {
        self.bridges.read().clone()
    }

    /// Picks a worker for a request under the configured strategy.
    ///
    /// `affinity` is the sticky key (client IP or session token); it only
    /// matters for [`ClusterStrategy::Sticky`].
    pub fn pick(&self, affinity: Option<&str>) -> Option<WorkerBridge> {
        let ready = self.ready();
        if ready.is_empty() {
            return None;
        }
        let index = match self.strategy {
            ClusterStrategy::RoundRobin => {
                self.rr_counter.fetch_add(1, Ordering::Relaxed) % ready.len()
            }
            ClusterStrategy::LeastLoaded => ready
                .iter()
                .enumerate()
                .min_by_key(|(_, b)| b.in_flight())
                .map(|(i, _)| i)
                .unwrap_or(0),
            ClusterStrategy::Sticky => match affinity {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() as usize) % ready.len()
                }
                None => self.rr_counter.fetch_add(1, Ordering::Relaxed) % ready.len(),
            },
        };
        Some(ready[index].clone())
    }
}
