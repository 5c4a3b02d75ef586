//! Admission control: the first four gates in front of every request.
//!
//! | Gate | Check | On fail |
//! |---|---|---|
//! | 1 | URL length | 414 |
//! | 2 | Declared body size | 413 |
//! | 3 | Global in-flight, else bounded FIFO queue | 503 |
//! | 4 | Per-IP in-flight | 429 |
//!
//! The global gate is a semaphore sized at `maxConcurrentRequests`; when
//! exhausted, up to `maxQueueSize` requests wait at most `queueTimeout` for
//! a slot. `maxQueueSize = 0` degenerates to an immediate 503 at capacity.
//! Permits and per-IP slots are released when the response future settles,
//! so the invariants hold across panics and early returns.

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error as ActixError;
use futures::future::{LocalBoxFuture, Ready};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::models::error::GatewayError;
use crate::models::settings::{ConcurrencySettings, PayloadSettings};

/// Shared admission state.
#[derive(Debug)]
pub struct AdmissionState {
    concurrency: ConcurrencySettings,
    payload: PayloadSettings,
    slots: Arc<Semaphore>,
    queued: AtomicUsize,
    per_ip: Mutex<HashMap<String, usize>>,
}

impl AdmissionState {
    pub fn new(concurrency: ConcurrencySettings, payload: PayloadSettings) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(concurrency.max_concurrent_requests));
        Arc::new(Self {
            concurrency,
            payload,
            slots,
            queued: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
        })
    }

    /// Requests currently waiting for a global slot.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// In-flight requests admitted through the global gate.
    pub fn in_flight(&self) -> usize {
        self.concurrency.max_concurrent_requests - self.slots.available_permits()
    }

    /// Gate 3: immediate slot, or a bounded queue wait.
    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, GatewayError> {
        if let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() {
            return Ok(permit);
        }
        if self.concurrency.max_queue_size == 0 {
            return Err(GatewayError::QueueFull);
        }
        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.concurrency.max_queue_size {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(GatewayError::QueueFull);
        }

        let waited = tokio::time::timeout(
            Duration::from_millis(self.concurrency.queue_timeout),
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await;
        self.queued.fetch_sub(1, Ordering::SeqCst);

        match waited {
            Ok(Ok(permit)) => Ok(permit),
            // Closed semaphore or queue timeout both reject the request.
            Ok(Err(_)) | Err(_) => Err(GatewayError::QueueFull),
        }
    }

    /// Gate 4: bounded concurrency per client address.
    fn acquire_ip_slot(state: Arc<Self>, ip: &str) -> Result<IpSlot, GatewayError> {
        let mut per_ip = state.per_ip.lock();
        let count = per_ip.entry(ip.to_string()).or_insert(0);
        if *count >= state.concurrency.max_per_ip {
            return Err(GatewayError::PerIpExceeded {
                limit: state.concurrency.max_per_ip,
            });
        }
        *count += 1;
        drop(per_ip);
        Ok(IpSlot {
            ip: ip.to_string(),
            state,
        })
    }

    fn release_ip_slot(&self, ip: &str) {
        let mut per_ip = self.per_ip.lock();
        if let Some(count) = per_ip.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(ip);
            }
        }
    }
}

/// RAII per-IP slot; releases on drop.
struct IpSlot {
    state: Arc<AdmissionState>,
    ip: String,
}

impl Drop for IpSlot {
    fn drop(&mut self) {
        self.state.release_ip_slot(&self.ip);
    }
}

/// Middleware factory wrapping the admission state.
#[derive(Clone)]
pub struct Admission {
    state: Arc<AdmissionState>,
}

impl Admission {
    pub fn new(state: Arc<AdmissionState>) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Admission
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Transform = AdmissionMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        futures::future::ready(Ok(AdmissionMiddleware {
            service: Arc::new(service),
            state: Arc::clone(&self.state),
        }))
    }
}

pub struct AdmissionMiddleware<S> {
    service: Arc<S>,
    state: Arc<AdmissionState>,
}

impl<S, B> Service<ServiceRequest> for AdmissionMiddleware<S>
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
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            // Gate 1: URL length covers path plus query.
            let url_len = req.uri().path().len()
                + req.uri().query().map(|q| q.len() + 1).unwrap_or(0);
            if url_len > state.payload.max_url_length {
                return Err(GatewayError::UrlTooLong {
                    limit: state.payload.max_url_length,
                }
                .into());
            }

            // Gate 2: declared body size. Undeclared bodies are bounded by
            // the payload extractor limit downstream.
            if let Some(len) = declared_content_length(&req) {
                if len > state.payload.max_body_size {
                    return Err(GatewayError::PayloadTooLarge {
                        limit: state.payload.max_body_size,
                    }
                    .into());
                }
            }

            // Gate 3: global concurrency with bounded queueing.
            let permit = state.acquire_slot().await.map_err(ActixError::from)?;

            // Gate 4: per-IP cap.
            let peer_ip = client_ip(&req);
            let ip_slot = AdmissionState::acquire_ip_slot(Arc::clone(&state), &peer_ip)
                .map_err(ActixError::from)?;

            debug!(
                "Admitted {} {} ({} in flight)",
                req.method(),
                req.path(),
                state.in_flight()
            );

            let result = service.call(req).await;
            drop(ip_slot);
            drop(permit);
            result
        })
    }
}

fn declared_content_length(req: &ServiceRequest) -> Option<usize> {
    req.headers()
        .get("content-length")?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Client address used for per-IP accounting and sticky scheduling.
pub fn client_ip(req: &ServiceRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .map(|addr| addr.split(':').next().unwrap_or(addr).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
