//! Runtime state for reverse-proxy upstreams.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::models::settings::UpstreamSettings;

/// One upstream with its live health and load state.
#[derive(Debug)]
pub struct Upstream {
    pub settings: UpstreamSettings,
    healthy: AtomicBool,
    in_flight: AtomicU64,
    consecutive_probe_failures: AtomicU32,
    consecutive_probe_successes: AtomicU32,
}

impl Upstream {
    pub fn new(settings: UpstreamSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            healthy: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
            consecutive_probe_failures: AtomicU32::new(0),
            consecutive_probe_successes: AtomicU32::new(0),
        })
    }

    /// `host:port` identity, shared with breakers and logs.
    pub fn key(&self) -> String {
        self.settings.key()
    }

    /// Base URL requests are forwarded to.
    pub fn base_url(&self) -> String {
        if self.settings.host.starts_with("http://") || self.settings.host.starts_with("https://") {
            format!("{}:{}", self.settings.host, self.settings.port)
        } else {
            format!("http://{}:{}", self.settings.host, self.settings.port)
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn start_request(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish_request(&self) {
        // Saturating: a crash between start/finish must not wrap.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Feeds one probe result; flips health state at the thresholds.
    /// Returns the new health value.
    pub fn record_probe(
        &self,
        success: bool,
        unhealthy_threshold: u32,
        healthy_threshold: u32,
    ) -> bool {
        if success {
            self.consecutive_probe_failures.store(0, Ordering::Relaxed);
            let streak = self
                .consecutive_probe_successes
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            if streak >= healthy_threshold {
                self.healthy.store(true, Ordering::Relaxed);
            }
        } else {
            self.consecutive_probe_successes.store(0, Ordering::Relaxed);
            let streak = self
                .consecutive_probe_failures
                .fetch_add(1, Ordering::Relaxed)
                + 1;
            if streak >= unhealthy_threshold {
                self.healthy.store(false, Ordering::Relaxed);
            }
        }
        self.is_healthy()
    }

    /// Test/ops override of health state.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }
}

/// The configured upstream set.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
}

impl UpstreamPool {
    pub fn new(settings: &[UpstreamSettings]) -> Self {
        Self {
            upstreams: settings.iter().cloned().map(Upstream::new).collect(),
        }
    }

    pub fn all(&self) -> &[Arc<Upstream>] {
        &self.upstreams
    }

    /// Upstreams currently eligible for traffic.
    pub fn healthy(&self) -> Vec<Arc<Upstream>> {
        self.upstreams
            .iter()
            .filter(|u| u.is_healthy())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(host: &str, port: u16) -> UpstreamSettings {
        UpstreamSettings {
            host: host.to_string(),
            port,
            weight: 1,
            max_connections: 8,
        }
    }

    #[test]
    fn health_flips_at_thresholds() {
        let upstream = Upstream::new(settings("u1", 80));
        assert!(upstream.is_healthy());

        assert!(upstream.record_probe(false, 3, 2));
        assert!(upstream.record_probe(false, 3, 2));
        // Third consecutive failure trips it.
        assert!(!upstream.record_probe(false, 3, 2));

        assert!(!upstream.record_probe(true, 3, 2));
        // Second consecutive success restores it.
        assert!(upstream.record_probe(true, 3, 2));
    }

    #[test]
    fn probe_streaks_reset_each_other() {
        let upstream = Upstream::new(settings("u1", 80));
        upstream.record_probe(false, 3, 2);
        upstream.record_probe(false, 3, 2);
        upstream.record_probe(true, 3, 2);
        // Streak broken; two more failures are not enough.
        upstream.record_probe(false, 3, 2);
        assert!(upstream.record_probe(false, 3, 2));
    }

    #[test]
    fn finish_without_start_does_not_wrap() {
        let upstream = Upstream::new(settings("u1", 80));
        upstream.finish_request();
        assert_eq!(upstream.in_flight(), 0);
    }

    #[test]
    fn base_url_adds_scheme_when_missing() {
        assert_eq!(
            Upstream::new(settings("10.0.0.5", 8080)).base_url(),
            "http://10.0.0.5:8080"
        );
        assert_eq!(
            Upstream::new(settings("https://svc.internal", 443)).base_url(),
            "https://svc.internal:443"
        );
    }
}
