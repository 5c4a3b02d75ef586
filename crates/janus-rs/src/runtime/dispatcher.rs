//! The per-request state machine inside a worker.
//!
//! ```text
//! [decoded] -> [pipeline onRequest] -> [session attach] -> [route match]
//!                    |                                          |
//!                    v                                          v
//!             [hook short-circuit]                      [handler chain]
//!                                                           |      |
//!                                            [Ok -> onResponse]  [Err -> onError chain]
//!                                                           |      |
//!                                                 [timing hooks, encode, send]
//! ```
//!
//! Cancellation (deadline or CANCEL frame) aborts the handler at its next
//! suspension point; the error chain sees a `Cancelled` sentinel and the
//! default rendering is 504.

use chrono::Utc;
use log::{error, warn};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::plugins::{PerformanceSnapshot, RequestTiming, RouteErrorInfo};
use crate::routing::RouteLookup;

use super::app::BuiltApp;
use super::message::{HandlerError, Request, Response};
use super::session::SessionLayer;

/// Process-wide dispatch counters feeding `onPerformanceMetrics`.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> PerformanceSnapshot {
        let requests = self.requests_total.load(Ordering::Relaxed);
        let latency = self.latency_total_ms.load(Ordering::Relaxed);
        PerformanceSnapshot {
            requests_total: requests,
            errors_total: self.errors_total.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                latency as f64 / requests as f64
            },
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

/// Translates decoded requests into responses.
#[derive(Clone)]
pub struct Dispatcher {
    app: Arc<BuiltApp>,
    session: Option<SessionLayer>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(app: Arc<BuiltApp>, session: Option<SessionLayer>) -> Self {
        Self {
            app,
            session,
            metrics: Arc::new(DispatchMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    pub fn app(&self) -> &Arc<BuiltApp> {
        &self.app
    }

    /// Runs one request to completion. Always produces a response; failure
    /// shapes are rendered here, never propagated to the IPC layer.
    pub async fn dispatch(&self, mut req: Request, cancel: CancellationToken) -> Response {
        let started = Instant::now();
        self.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
        self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);

        let mut handler_ms = 0u64;
        let mut response = self
            .dispatch_inner(&mut req, cancel, &mut handler_ms)
            .await;

        if let Some(ref session) = self.session {
            session.finalize(&req, &mut response).await;
        }
        self.app.plugins.run_response_hooks(&req, &mut response).await;

        let total_ms = started.elapsed().as_millis() as u64;
        let timing = RequestTiming {
            total_ms,
            hook_ms: total_ms.saturating_sub(handler_ms),
            handler_ms,
        };
        self.app
            .plugins
            .notify_request_timing(&timing, &req, &response)
            .await;

        self.metrics
            .latency_total_ms
            .fetch_add(total_ms, Ordering::Relaxed);
        if response.status >= 500 {
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
        response
    }

    async fn dispatch_inner(
        &self,
        req: &mut Request,
        cancel: CancellationToken,
        handler_ms: &mut u64,
    ) -> Response {
        // Pre-routing interception.
        match self.app.plugins.run_request_hooks(req).await {
            Ok(None) => {}
            Ok(Some(short_circuit)) => return short_circuit,
            Err(hook_err) => {
                return self.render_error(HandlerError::from(hook_err), req).await;
            }
        }

        if let Some(ref session) = self.session {
            session.attach(req).await;
        }

        let (chain, timeout_override) = match self.app.table.lookup(&req.method, &req.path) {
            RouteLookup::Found { value, params } => {
                req.params = params;
                (value.chain.clone(), value.timeout_ms)
            }
            RouteLookup::MethodNotAllowed { allow } => {
                let info = RouteErrorInfo {
                    status: 405,
                    path: req.path.clone(),
                    method: req.method.clone(),
                };
                self.app.plugins.notify_route_error(&info, req).await;
                let mut resp = error_response(405, "method-not-allowed", "Method not allowed", req.id);
                resp.set_header("allow", allow.join(", "));
                return resp;
            }
            RouteLookup::NotFound => {
                let info = RouteErrorInfo {
                    status: 404,
                    path: req.path.clone(),
                    method: req.method.clone(),
                };
                self.app.plugins.notify_route_error(&info, req).await;
                return error_response(404, "not-found", "No route matches this path", req.id);
            }
        };

        // The gateway already folded per-route overrides into the deadline;
        // applying the override here as well keeps a lone worker honest.
        let mut budget = req.remaining_ms();
        if let Some(route_ms) = timeout_override {
            budget = budget.min(route_ms);
        }

        let handler_started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
            _ = tokio::time::sleep(Duration::from_millis(budget)) => Err(HandlerError::Cancelled),
            result = chain.run(req) => result,
        };
        *handler_ms = handler_started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => response,
            Err(err) => self.render_error(err, req).await,
        }
    }

    /// Runs the error chain in reverse order; falls back to the default
    /// rendering when no plugin writes a response.
    async fn render_error(&self, err: HandlerError, req: &Request) -> Response {
        if let Some(response) = self.app.plugins.run_error_hooks(&err, req).await {
            return response;
        }
        match err {
            HandlerError::Cancelled => {
                warn!("{} {} cancelled at deadline", req.method, req.path);
                error_response(504, "timeout", "Request deadline exceeded", req.id)
            }
            HandlerError::Failed { message } => {
                let error_id = Uuid::new_v4();
                let line = format!(
                    "Handler error {} on {} {}: {}",
                    error_id, req.method, req.path, message
                );
                error!("{}", line);
                // Framework log lines are visible to plugins holding the
                // console-intercept permission.
                self.app.plugins.notify_console_intercept(&line);
                error_response(
                    500,
                    "handler-error",
                    &format!("Internal error {}", error_id),
                    req.id,
                )
            }
        }
    }
}

/// JSON error body in the gateway's response shape.
fn error_response(status: u16, kind: &str, message: &str, request_id: Uuid) -> Response {
    Response::json(
        status,
        &json!({
            "error": kind,
            "message": message,
            "requestId": request_id.to_string(),
        }),
    )
}

/// Current Unix milliseconds; the worker-side deadline arithmetic helper.
pub fn unix_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
