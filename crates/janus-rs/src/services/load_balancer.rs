//! Load balancing strategies over healthy upstreams.
//!
//! All strategies select from the healthy subset only; an empty subset means
//! the proxy has nowhere to send the request and answers 503 upstream of
//! here. Selection never blocks.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::models::settings::ProxyStrategy;

use super::upstream::Upstream;

/// Strategy interface: pick one upstream for a request.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, healthy: &[Arc<Upstream>], client_ip: Option<&str>) -> Option<Arc<Upstream>>;
}

/// Atomic counter modulo the healthy set.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, healthy: &[Arc<Upstream>], _client_ip: Option<&str>) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(Arc::clone(&healthy[index]))
    }
}

/// Weight-interleaved round robin: an upstream with weight `w` takes `w`
/// slots of the expanded cycle.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(&self, healthy: &[Arc<Upstream>], _client_ip: Option<&str>) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        let total_weight: u64 = healthy
            .iter()
            .map(|u| u.settings.weight.max(1) as u64)
            .sum();
        if total_weight == 0 {
            return None;
        }
        let mut slot = (self.counter.fetch_add(1, Ordering::Relaxed) as u64) % total_weight;
        for upstream in healthy {
            let weight = upstream.settings.weight.max(1) as u64;
            if slot < weight {
                return Some(Arc::clone(upstream));
            }
            slot -= weight;
        }
        Some(Arc::clone(&healthy[0]))
    }
}

/// Minimum in-flight count, weight as the tie-break.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(&self, healthy: &[Arc<Upstream>], _client_ip: Option<&str>) -> Option<Arc<Upstream>> {
        healthy
            .iter()
            .min_by_key(|u| (u.in_flight(), u64::MAX - u.settings.weight as u64))
            .cloned()
    }
}

/// Stable client-IP hash for session affinity.
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    fn hash_ip(ip: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        ip.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancer for IpHashBalancer {
    fn select(&self, healthy: &[Arc<Upstream>], client_ip: Option<&str>) -> Option<Arc<Upstream>> {
        if healthy.is_empty() {
            return None;
        }
        match client_ip {
            Some(ip) => {
                let index = (Self::hash_ip(ip) as usize) % healthy.len();
                Some(Arc::clone(&healthy[index]))
            }
            None => Some(Arc::clone(&healthy[0])),
        }
    }
}

/// Builds the balancer for a configured strategy.
pub fn balancer_for(strategy: ProxyStrategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        ProxyStrategy::RoundRobin => Arc::new(RoundRobinBalancer::default()),
        ProxyStrategy::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::default()),
        ProxyStrategy::LeastConnections => Arc::new(LeastConnectionsBalancer),
        ProxyStrategy::IpHash => Arc::new(IpHashBalancer),
    }
}
