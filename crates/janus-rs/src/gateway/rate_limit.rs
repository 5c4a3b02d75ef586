//! Fixed-window rate limiting with standard `RateLimit-*` headers.
//!
//! One counter per key (client IP, or IP + route under the `per-ip-route`
//! strategy). A window is `[start, start + window_ms)`; the first request
//! past the boundary rolls the window over. Counter updates are linearizable
//! per key: the store holds one lock across the read-modify-write.
//!
//! When a request is rejected the `onRateLimit` plugin hook fires before the
//! 429 is written, and the response carries `RateLimit-Limit`,
//! `RateLimit-Remaining: 0`, and `RateLimit-Reset`.

use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::{HeaderName, HeaderValue};
use actix_web::Error as ActixError;
use chrono::Utc;
use futures::future::{LocalBoxFuture, Ready};
use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::models::error::GatewayError;
use crate::models::settings::{RateLimitSettings, RateLimitStrategy};
use crate::plugins::{PluginManager, RateLimitInfo};

use super::admission::client_ip;

#[derive(Debug, Clone)]
struct Window {
    count: u64,
    start_ms: i64,
}

/// Verdict for one request against its key's window.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix milliseconds when the window rolls over.
    pub reset_ms: i64,
}

/// The fixed-window counter store.
#[derive(Debug)]
pub struct RateLimitStore {
    limit: u64,
    window_ms: u64,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimitStore {
    pub fn new(limit: u64, window_ms: u64) -> Self {
        Self {
            limit,
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request against `key` and returns the verdict.
    pub fn check(&self, key: &str) -> RateLimitVerdict {
        self.check_at(key, Utc::now().timestamp_millis())
    }

    /// Clock-injected variant, used by tests to cross window edges.
    pub fn check_at(&self, key: &str, now_ms: i64) -> RateLimitVerdict {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            start_ms: now_ms,
        });

        if now_ms - window.start_ms >= self.window_ms as i64 {
            window.count = 0;
            window.start_ms = now_ms;
        }

        let reset_ms = window.start_ms + self.window_ms as i64;
        if window.count >= self.limit {
            return RateLimitVerdict {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_ms,
            };
        }
        window.count += 1;
        RateLimitVerdict {
            allowed: true,
            limit: self.limit,
            remaining: self.limit - window.count,
            reset_ms,
        }
    }

    /// Drops windows stale for more than two periods.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let ttl = 2 * self.window_ms as i64;
        self.windows
            .lock()
            .retain(|_, w| now - w.start_ms < ttl);
    }
}

/// Middleware factory for the limiter gate.
#[derive(Clone)]
pub struct RateLimit {
    settings: RateLimitSettings,
    store: Arc<RateLimitStore>,
    plugins: Arc<PluginManager>,
}

impl RateLimit {
    pub fn new(settings: RateLimitSettings, plugins: Arc<PluginManager>) -> Self {
        let store = Arc::new(RateLimitStore::new(
            settings.global.requests,
            settings.global.window,
        ));
        Self {
            settings,
            store,
            plugins,
        }
    }

    pub fn store(&self) -> &Arc<RateLimitStore> {
        &self.store
    }

    fn key_for(&self, req: &ServiceRequest) -> String {
        let ip = client_ip(req);
        match self.settings.strategy {
            RateLimitStrategy::PerIp => format!("ip:{}", ip),
            RateLimitStrategy::PerIpRoute => format!("ip:{}:{}", ip, req.path()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Transform = RateLimitMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        futures::future::ready(Ok(RateLimitMiddleware {
            service: Arc::new(service),
            limiter: self.clone(),
        }))
    }
}

pub struct RateLimitMiddleware<S> {
    service: Arc<S>,
    limiter: RateLimit,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
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
        let limiter = self.limiter.clone();

        Box::pin(async move {
            if !limiter.settings.enabled {
                return service.call(req).await;
            }

            let key = limiter.key_for(&req);
            let verdict = limiter.store.check(&key);

            if !verdict.allowed {
                let peer = client_ip(&req);
                warn!("Rate limit exceeded for {}", key);
                let info = RateLimitInfo {
                    key: key.clone(),
                    limit: verdict.limit,
                    remaining: 0,
                    reset_ms: verdict.reset_ms,
                };
                limiter
                    .plugins
                    .notify_rate_limit(&info, &peer, req.path())
                    .await;

                let retry_after_ms =
                    (verdict.reset_ms - Utc::now().timestamp_millis()).max(0) as u64;
                return Err(RateLimited {
                    error: GatewayError::RateLimited { retry_after_ms },
                    verdict,
                }
                .into());
            }

            let mut res = service.call(req).await?;
            stamp_headers(res.headers_mut(), &verdict);
            Ok(res)
        })
    }
}

fn stamp_headers(headers: &mut actix_web::http::header::HeaderMap, verdict: &RateLimitVerdict) {
    let pairs = [
        ("ratelimit-limit", verdict.limit.to_string()),
        ("ratelimit-remaining", verdict.remaining.to_string()),
        (
            "ratelimit-reset",
            ((verdict.reset_ms.max(0) as u64) / 1000).to_string(),
        ),
    ];
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// The 429 rejection: the gateway error body plus the limiter headers.
#[derive(Debug)]
struct RateLimited {
    error: GatewayError,
    verdict: RateLimitVerdict,
}

impl std::fmt::Display for RateLimited {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl actix_web::error::ResponseError for RateLimited {
    fn status_code(&self) -> actix_web::http::StatusCode {
        self.error.status()
    }

    fn error_response(&self) -> actix_web::HttpResponse {
        let mut response = self.error.to_response(&uuid::Uuid::new_v4().to_string());
        stamp_headers(response.headers_mut(), &self.verdict);
        response
    }
}
