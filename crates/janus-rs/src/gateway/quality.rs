//! Network-quality gate: reject early when the link itself is the problem.
//!
//! The monitor keeps an exponentially weighted average of response latency
//! and a rough bandwidth estimate (response bytes over wall time). When the
//! gate is enabled and `rejectOnPoorConnection` is set, requests are
//! refused with 503 while the averages sit outside the configured bounds.

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error as ActixError;
use futures::future::{LocalBoxFuture, Ready};
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::models::error::GatewayError;
use crate::models::settings::NetworkQualitySettings;

const EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Default)]
struct QualityInner {
    avg_latency_ms: f64,
    avg_bandwidth_bps: f64,
    samples: u64,
}

/// Link-quality estimator fed by completed requests.
#[derive(Debug, Default)]
pub struct QualityMonitor {
    inner: Mutex<QualityInner>,
}

impl QualityMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records one completed request.
    pub fn record(&self, latency_ms: f64, response_bytes: usize) {
        let mut inner = self.inner.lock();
        if inner.samples == 0 {
            inner.avg_latency_ms = latency_ms;
        } else {
            inner.avg_latency_ms =
                EWMA_ALPHA * latency_ms + (1.0 - EWMA_ALPHA) * inner.avg_latency_ms;
        }
        if latency_ms > 0.0 {
            let bps = response_bytes as f64 * 1000.0 / latency_ms;
            if inner.samples == 0 {
                inner.avg_bandwidth_bps = bps;
            } else {
                inner.avg_bandwidth_bps =
                    EWMA_ALPHA * bps + (1.0 - EWMA_ALPHA) * inner.avg_bandwidth_bps;
            }
        }
        inner.samples += 1;
    }

    pub fn avg_latency_ms(&self) -> f64 {
        self.inner.lock().avg_latency_ms
    }

    pub fn avg_bandwidth_bps(&self) -> f64 {
        self.inner.lock().avg_bandwidth_bps
    }

    /// The gate verdict under `settings`; `Ok` when quality is acceptable.
    pub fn verdict(&self, settings: &NetworkQualitySettings) -> Result<(), GatewayError> {
        if !settings.enabled || !settings.reject_on_poor_connection {
            return Ok(());
        }
        let inner = self.inner.lock();
        // No samples yet means no evidence to reject on.
        if inner.samples < 8 {
            return Ok(());
        }
        if settings.max_latency > 0 && inner.avg_latency_ms > settings.max_latency as f64 {
            return Err(GatewayError::QualityRejected {
                reason: format!(
                    "average latency {:.0} ms exceeds {} ms",
                    inner.avg_latency_ms, settings.max_latency
                ),
            });
        }
        if settings.min_bandwidth > 0
            && inner.avg_bandwidth_bps < settings.min_bandwidth as f64
        {
            return Err(GatewayError::QualityRejected {
                reason: format!(
                    "estimated bandwidth {:.0} B/s below {} B/s",
                    inner.avg_bandwidth_bps, settings.min_bandwidth
                ),
            });
        }
        Ok(())
    }
}

/// Middleware running the gate in front of the handler.
#[derive(Clone)]
pub struct QualityGate {
    monitor: Arc<QualityMonitor>,
    settings: NetworkQualitySettings,
}

impl QualityGate {
    pub fn new(monitor: Arc<QualityMonitor>, settings: NetworkQualitySettings) -> Self {
        Self { monitor, settings }
    }
}

impl<S, B> Transform<S, ServiceRequest> for QualityGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Transform = QualityGateMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        futures::future::ready(Ok(QualityGateMiddleware {
            service: Arc::new(service),
            monitor: Arc::clone(&self.monitor),
            settings: self.settings.clone(),
        }))
    }
}

pub struct QualityGateMiddleware<S> {
    service: Arc<S>,
    monitor: Arc<QualityMonitor>,
    settings: NetworkQualitySettings,
}

impl<S, B> Service<ServiceRequest> for QualityGateMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Arc::clone(&self.service);
        let monitor = Arc::clone(&self.monitor);
        let settings = self.settings.clone();

        Box::pin(async move {
            monitor.verdict(&settings).map_err(ActixError::from)?;
            service.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_latency: u64, min_bandwidth: u64) -> NetworkQualitySettings {
        NetworkQualitySettings {
            enabled: true,
            reject_on_poor_connection: true,
            min_bandwidth,
            max_latency,
        }
    }

    #[test]
    fn no_samples_means_no_rejection() {
        let monitor = QualityMonitor::new();
        assert!(monitor.verdict(&settings(10, 0)).is_ok());
    }

    #[test]
    fn slow_link_is_rejected_after_warmup() {
        let monitor = QualityMonitor::new();
        for _ in 0..10 {
            monitor.record(500.0, 1024);
        }
        let err = monitor.verdict(&settings(100, 0)).unwrap_err();
        assert!(matches!(err, GatewayError::QualityRejected { .. }));
    }

    #[test]
    fn fast_link_passes() {
        let monitor = QualityMonitor::new();
        for _ in 0..10 {
            monitor.record(5.0, 64 * 1024);
        }
        assert!(monitor.verdict(&settings(100, 1_000)).is_ok());
    }

    #[test]
    fn disabled_gate_never_rejects() {
        let monitor = QualityMonitor::new();
        for _ in 0..10 {
            monitor.record(10_000.0, 1);
        }
        let mut s = settings(1, u64::MAX);
        s.enabled = false;
        assert!(monitor.verdict(&s).is_ok());
    }

    #[test]
    fn ewma_tracks_recent_latency() {
        let monitor = QualityMonitor::new();
        for _ in 0..20 {
            monitor.record(10.0, 1024);
        }
        let before = monitor.avg_latency_ms();
        for _ in 0..20 {
            monitor.record(200.0, 1024);
        }
        assert!(monitor.avg_latency_ms() > before * 5.0);
    }
}
