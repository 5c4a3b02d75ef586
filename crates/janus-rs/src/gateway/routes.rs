//! Gateway-owned HTTP endpoints: health probes and the catch-all.
//!
//! Health lives under `/janus/health` so it never collides with
//! application routes; everything else falls through to the catch-all and
//! the worker/proxy dispatch.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use crate::cluster::WorkerRegistry;
use crate::services::upstream::UpstreamPool;

use super::admission::AdmissionState;
use super::handler::GatewayHandler;

/// Read-only state behind the health endpoints.
pub struct HealthState {
    pub started_at: DateTime<Utc>,
    pub registry: Arc<WorkerRegistry>,
    pub admission: Arc<AdmissionState>,
    pub upstreams: Option<UpstreamPool>,
}

async fn health(state: web::Data<HealthState>) -> HttpResponse {
    let ready = state.registry.ready_count();
    let upstreams: Vec<serde_json::Value> = state
        .upstreams
        .as_ref()
        .map(|pool| {
            pool.all()
                .iter()
                .map(|u| {
                    json!({
                        "upstream": u.key(),
                        "healthy": u.is_healthy(),
                        "inFlight": u.in_flight(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let status = if ready > 0 { "healthy" } else { "degraded" };
    HttpResponse::Ok().json(json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at.to_rfc3339(),
        "uptimeSecs": (Utc::now() - state.started_at).num_seconds(),
        "workers": {
            "ready": ready,
            "inFlight": state.registry.total_in_flight(),
        },
        "admission": {
            "inFlight": state.admission.in_flight(),
            "queued": state.admission.queued(),
        },
        "upstreams": upstreams,
    }))
}

/// Liveness: the process is up and serving its event loop.
async fn live() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "alive" }))
}

/// Readiness: at least one worker can take traffic.
async fn ready(state: web::Data<HealthState>) -> HttpResponse {
    if state.registry.ready_count() > 0 {
        HttpResponse::Ok().json(json!({ "status": "ready" }))
    } else {
        HttpResponse::ServiceUnavailable().json(json!({ "status": "no ready workers" }))
    }
}

/// Registers the health endpoints.
pub fn configure_health(cfg: &mut web::ServiceConfig, state: web::Data<HealthState>) {
    cfg.app_data(state)
        .service(web::resource("/janus/health").route(web::get().to(health)))
        .service(web::resource("/janus/health/live").route(web::get().to(live)))
        .service(web::resource("/janus/health/ready").route(web::get().to(ready)));
}

/// Registers the catch-all resource feeding the gateway handler.
pub fn configure_catch_all(
    cfg: &mut web::ServiceConfig,
    handler: Arc<GatewayHandler>,
    max_body_size: usize,
) {
    cfg.app_data(web::PayloadConfig::new(max_body_size))
        .service(web::resource("/{tail:.*}").to(
            move |req: HttpRequest, body: web::Bytes| {
                let handler = Arc::clone(&handler);
                async move { handler.handle(req, body).await }
            },
        ));
}
