//! The catch-all ingress handler.
//!
//! After the admission middleware has let a request through, this handler
//! classifies the route (worker-bound or proxied, plus any per-route
//! deadline override), computes the absolute deadline, and executes the
//! dispatch with the configured resilience policy. Every response leaving
//! here carries `X-Request-Id` and `X-Response-Time-Ms`.

use actix_web::body::MessageBody;
use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use log::{debug, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::cluster::WorkerRegistry;
use crate::models::error::GatewayError;
use crate::models::settings::{ProxyErrorMode, Settings};
use crate::plugins::PluginManager;
use crate::protocol::RequestRecord;
use crate::routing::{RouteLookup, RouteTable};
use crate::services::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig, CircuitBreakerError};
use crate::services::load_balancer::{balancer_for, LoadBalancer};
use crate::services::upstream::{Upstream, UpstreamPool};

use super::compression;
use super::quality::QualityMonitor;

/// Methods safe to retry per RFC 9110 semantics.
fn idempotent(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS")
}

/// Route classification: where the request goes and under what deadline.
#[derive(Debug, Clone, Default)]
struct RouteClass {
    timeout_ms: Option<u64>,
    proxied: bool,
}

/// Classification key for method-agnostic gateway routes.
const ANY_METHOD: &str = "ANY";

/// Everything the catch-all needs, shared across worker threads.
pub struct GatewayHandler {
    settings: Arc<Settings>,
    registry: Arc<WorkerRegistry>,
    plugins: Arc<PluginManager>,
    quality: Arc<QualityMonitor>,
    classes: RouteTable<RouteClass>,
    pool: Option<UpstreamPool>,
    balancer: Arc<dyn LoadBalancer>,
    breakers: BreakerRegistry,
    client: reqwest::Client,
}

impl GatewayHandler {
    pub fn new(
        settings: Arc<Settings>,
        registry: Arc<WorkerRegistry>,
        plugins: Arc<PluginManager>,
        quality: Arc<QualityMonitor>,
    ) -> Self {
        let classes = build_classes(&settings);
        let proxy = &settings.network.proxy;
        let pool = proxy.enabled.then(|| UpstreamPool::new(&proxy.upstreams));
        let balancer = balancer_for(proxy.load_balancing);

        let breaker_cfg = &settings.request_management.resilience.circuit_breaker;
        let breakers = BreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: breaker_cfg.failure_threshold,
            reset_timeout: Duration::from_millis(breaker_cfg.reset_timeout),
        });

        let pool_cfg = &settings.network.connection.connection_pool;
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_millis(pool_cfg.idle_timeout))
            .pool_max_idle_per_host(pool_cfg.max_idle_per_host)
            .build()
            .unwrap_or_default();

        Self {
            settings,
            registry,
            plugins,
            quality,
            classes,
            pool,
            balancer,
            breakers,
            client,
        }
    }

    /// The upstream pool, exposed for the health prober and endpoints.
    pub fn upstream_pool(&self) -> Option<&UpstreamPool> {
        self.pool.as_ref()
    }

    /// Entry point wired to the actix catch-all resource.
    pub async fn handle(&self, req: HttpRequest, body: web::Bytes) -> HttpResponse {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let class = self.classify(req.path());
        let timeouts = &self.settings.request_management.timeout;
        let timeout_ms = if timeouts.enabled {
            class.timeout_ms.unwrap_or(timeouts.default_timeout)
        } else {
            timeouts.default_timeout
        };

        let outcome = if class.proxied && self.pool.is_some() {
            self.proxy_dispatch(&req, body, timeout_ms).await
        } else {
            self.worker_dispatch(&req, body, timeout_ms).await
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(error) => {
                debug!("{} {} rejected: {}", req.method(), req.path(), error);
                error.to_response(&request_id)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let body_size = match response.body().size() {
            actix_web::body::BodySize::Sized(n) => n as usize,
            _ => 0,
        };
        self.quality.record(elapsed_ms as f64, body_size);
        self.finish_headers(&mut response, &request_id, elapsed_ms);
        response
    }

    fn classify(&self, path: &str) -> RouteClass {
        match self.classes.lookup(ANY_METHOD, path) {
            RouteLookup::Found { value, .. } => value.clone(),
            _ => RouteClass::default(),
        }
    }

    // -- worker path --------------------------------------------------------

    async fn worker_dispatch(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        timeout_ms: u64,
    ) -> Result<HttpResponse, GatewayError> {
        let peer_ip = peer_ip(req);
        let affinity = self.sticky_key(req, &peer_ip);
        let bridge = self
            .registry
            .pick(affinity.as_deref())
            .ok_or(GatewayError::NoWorker)?;

        let record = request_record(req, &peer_ip, timeout_ms);
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let (resp_record, resp_body) = bridge.dispatch(&record, body.into(), deadline).await?;

        let status = StatusCode::from_u16(resp_record.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut builder = HttpResponse::build(status);
        for (name, value) in &resp_record.headers {
            if !hop_by_hop(name) {
                builder.append_header((name.as_str(), value.as_str()));
            }
        }
        self.apply_compression_policy(&mut builder, &resp_record.headers, resp_body.len());
        Ok(builder.body(resp_body))
    }

    /// Sticky scheduling key: session token when present, client IP
    /// otherwise.
    fn sticky_key(&self, req: &HttpRequest, peer_ip: &str) -> Option<String> {
        if self.settings.xems.enable {
            if let Some(token) = req
                .headers()
                .get(self.settings.xems.header_name.as_str())
                .and_then(|v| v.to_str().ok())
            {
                return Some(token.to_string());
            }
        }
        Some(peer_ip.to_string())
    }

    // -- proxy path ---------------------------------------------------------

    async fn proxy_dispatch(
        &self,
        req: &HttpRequest,
        body: web::Bytes,
        timeout_ms: u64,
    ) -> Result<HttpResponse, GatewayError> {
        let Some(ref pool) = self.pool else {
            return Err(GatewayError::NoUpstream);
        };
        let resilience = &self.settings.request_management.resilience;
        let proxy = &self.settings.network.proxy;
        let peer_ip = peer_ip(req);

        let retries_allowed = resilience.retry_enabled
            && proxy.on_error == ProxyErrorMode::Retry
            && idempotent(req.method().as_str());
        let max_attempts = if retries_allowed {
            resilience.max_retries + 1
        } else {
            1
        };

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        let mut last_error = GatewayError::NoUpstream;

        for attempt in 0..max_attempts {
            let healthy = pool.healthy();
            let upstream = self
                .balancer
                .select(&healthy, Some(&peer_ip))
                .ok_or(GatewayError::NoUpstream)?;
            let breaker = self.breakers.get(&upstream.key());

            let is_last = attempt + 1 == max_attempts;
            let feed_breaker = resilience.count_retries_in_breaker || is_last;

            let attempt_future =
                self.forward_once(req, &body, &upstream, timeout_ms, deadline);
            let result = if feed_breaker {
                match breaker.call(attempt_future).await {
                    Ok(response) => Ok(response),
                    Err(CircuitBreakerError::CircuitOpen) => {
                        last_error = GatewayError::CircuitOpen {
                            service: upstream.key(),
                        };
                        // A different upstream may still be closed.
                        continue;
                    }
                    Err(CircuitBreakerError::OperationFailed(e)) => Err(e),
                }
            } else {
                use crate::services::circuit_breaker::CircuitState;
                if breaker.state() == CircuitState::Open {
                    last_error = GatewayError::CircuitOpen {
                        service: upstream.key(),
                    };
                    continue;
                }
                attempt_future.await
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(
                        "Proxy attempt {}/{} to {} failed: {}",
                        attempt + 1,
                        max_attempts,
                        upstream.key(),
                        e
                    );
                    last_error = e;
                    if is_last {
                        break;
                    }
                    // Exponential backoff bounded by the request deadline.
                    let backoff =
                        Duration::from_millis(resilience.retry_delay << attempt.min(8));
                    if tokio::time::Instant::now() + backoff >= deadline {
                        return Err(GatewayError::Timeout { timeout_ms });
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        if max_attempts > 1 {
            if let GatewayError::Upstream { .. } = last_error {
                return Err(GatewayError::RetriesExhausted {
                    attempts: max_attempts,
                });
            }
        }
        Err(last_error)
    }

    /// One forwarding attempt. Transport errors and the transient statuses
    /// (502, 504) are failures; everything else, including upstream 4xx/5xx,
    /// passes through as the response.
    async fn forward_once(
        &self,
        req: &HttpRequest,
        body: &web::Bytes,
        upstream: &Arc<Upstream>,
        timeout_ms: u64,
        deadline: tokio::time::Instant,
    ) -> Result<HttpResponse, GatewayError> {
        let url = format!(
            "{}{}",
            upstream.base_url(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut outgoing = self.client.request(method, &url);
        for (name, value) in req.headers() {
            if hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                outgoing = outgoing.header(name.as_str(), v);
            }
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let budget = remaining.min(Duration::from_millis(
            self.settings.network.proxy.timeout.min(timeout_ms),
        ));

        upstream.start_request();
        let sent = tokio::time::timeout(budget, outgoing.body(body.to_vec()).send()).await;
        upstream.finish_request();

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return Err(GatewayError::Upstream {
                    url,
                    message: e.to_string(),
                })
            }
            Err(_) => return Err(GatewayError::Timeout { timeout_ms }),
        };

        let status = response.status().as_u16();
        if status == 502 || status == 504 {
            return Err(GatewayError::Upstream {
                url,
                message: format!("upstream answered {}", status),
            });
        }

        let mut builder =
            HttpResponse::build(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
        let mut headers: Vec<(String, String)> = Vec::new();
        for (name, value) in response.headers() {
            if hop_by_hop(name.as_str()) {
                continue;
            }
            if let Ok(v) = value.to_str() {
                headers.push((name.as_str().to_string(), v.to_string()));
                builder.append_header((name.as_str(), v));
            }
        }
        let bytes = response.bytes().await.map_err(|e| GatewayError::Upstream {
            url,
            message: e.to_string(),
        })?;
        self.apply_compression_policy(&mut builder, &headers, bytes.len());
        Ok(builder.body(bytes))
    }

    // -- response finishing -------------------------------------------------

    fn apply_compression_policy(
        &self,
        builder: &mut actix_web::HttpResponseBuilder,
        headers: &[(String, String)],
        body_len: usize,
    ) {
        let compression = &self.settings.network.compression;
        let content_type = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
            .map(|(_, v)| v.as_str());
        let already_encoded = headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-encoding"));
        if !already_encoded && compression::exempt(compression, content_type, body_len) {
            // Tells the Compress wrapper to leave the body alone.
            builder.insert_header(("content-encoding", "identity"));
        }
    }

    fn finish_headers(&self, response: &mut HttpResponse, request_id: &str, elapsed_ms: u64) {
        let headers = response.headers_mut();
        if !headers.contains_key("x-request-id") {
            if let Ok(value) = actix_web::http::header::HeaderValue::from_str(request_id) {
                headers.insert(
                    actix_web::http::header::HeaderName::from_static("x-request-id"),
                    value,
                );
            }
        }
        if let Ok(value) =
            actix_web::http::header::HeaderValue::from_str(&elapsed_ms.to_string())
        {
            headers.insert(
                actix_web::http::header::HeaderName::from_static("x-response-time-ms"),
                value,
            );
        }
        if self.settings.server.powered_by_header {
            headers.insert(
                actix_web::http::header::HeaderName::from_static("x-powered-by"),
                actix_web::http::header::HeaderValue::from_static("janus"),
            );
        }
    }

    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }
}

/// Builds the method-agnostic classification table from the configuration.
fn build_classes(settings: &Settings) -> RouteTable<RouteClass> {
    let mut table = RouteTable::new();
    let timeouts = &settings.request_management.timeout.routes;

    for pattern in &settings.network.proxy.routes {
        let class = RouteClass {
            timeout_ms: timeouts.get(pattern).copied(),
            proxied: true,
        };
        if let Err(e) = table.insert(ANY_METHOD, pattern, class) {
            warn!("Ignoring proxy route {}: {}", pattern, e);
        }
    }
    for (pattern, timeout_ms) in timeouts {
        if settings.network.proxy.routes.contains(pattern) {
            continue;
        }
        let class = RouteClass {
            timeout_ms: Some(*timeout_ms),
            proxied: false,
        };
        if let Err(e) = table.insert(ANY_METHOD, pattern, class) {
            warn!("Ignoring timeout override {}: {}", pattern, e);
        }
    }
    table
}

fn peer_ip(req: &HttpRequest) -> String {
    req.connection_info()
        .realip_remote_addr()
        .map(|addr| addr.split(':').next().unwrap_or(addr).to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn request_record(req: &HttpRequest, peer_ip: &str, timeout_ms: u64) -> RequestRecord {
    let query: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| {
            q.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default();

    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter(|(name, _)| !hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    RequestRecord {
        method: req.method().as_str().to_string(),
        path: req.path().to_string(),
        query,
        headers,
        peer_ip: peer_ip.to_string(),
        deadline_ms: crate::runtime::dispatcher::unix_ms() + timeout_ms,
    }
}

/// Hop-by-hop headers never forwarded across a proxy boundary.
fn hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_methods_match_the_contract() {
        for m in ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"] {
            assert!(idempotent(m), "{} should be idempotent", m);
        }
        for m in ["POST", "PATCH", "CONNECT"] {
            assert!(!idempotent(m), "{} should not be idempotent", m);
        }
    }

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(hop_by_hop("Connection"));
        assert!(hop_by_hop("transfer-encoding"));
        assert!(!hop_by_hop("content-type"));
        assert!(!hop_by_hop("authorization"));
    }

    #[test]
    fn classification_covers_proxy_and_timeout_routes() {
        let mut settings = Settings::default();
        settings.network.proxy.enabled = true;
        settings.network.proxy.routes = vec!["/api/**".to_string()];
        settings
            .request_management
            .timeout
            .routes
            .insert("/sleep".to_string(), 100);

        let table = build_classes(&settings);
        match table.lookup(ANY_METHOD, "/api/users/1") {
            RouteLookup::Found { value, .. } => assert!(value.proxied),
            other => panic!("expected proxy class, got {:?}", other),
        }
        match table.lookup(ANY_METHOD, "/sleep") {
            RouteLookup::Found { value, .. } => {
                assert!(!value.proxied);
                assert_eq!(value.timeout_ms, Some(100));
            }
            other => panic!("expected timeout class, got {:?}", other),
        }
        assert!(matches!(
            table.lookup(ANY_METHOD, "/elsewhere"),
            RouteLookup::NotFound
        ));
    }
}
