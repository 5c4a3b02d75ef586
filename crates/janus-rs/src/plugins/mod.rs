//! The plugin pipeline: ordered, permission-gated interception.
//!
//! Plugins implement [`Plugin`] with default no-op hooks and register with a
//! [`manager::PluginManager`] before the server starts; the registration
//! window closes at start and the chain order is frozen. Every invocation is
//! gated by the configured permission matrix (a denied hook is silently
//! skipped, never an error) and timed into a ring buffer that feeds the
//! timing and performance hooks.
//!
//! The same pipeline type runs in both processes: the worker drives the
//! request/response/error hooks around handlers, the gateway drives the
//! rate-limit, security, and performance hooks around admission.

pub mod manager;

use async_trait::async_trait;
use serde::Serialize;

use crate::runtime::app::AppRouter;
use crate::runtime::message::{HandlerError, HookFlow, Request, Response};

pub use manager::{PluginManager, TimingRing};

/// Every interception point in the pipeline.
///
/// The wire names (used in `pluginPermissions`) are the camelCase hook names
/// from the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Register,
    ServerStart,
    ServerReady,
    ServerStop,
    Request,
    Response,
    Error,
    SecurityThreat,
    RateLimit,
    RequestTiming,
    RouteError,
    PerformanceMetrics,
    ConsoleIntercept,
    RegisterRoutes,
}

impl Hook {
    /// Configuration-facing name of this hook.
    pub fn name(&self) -> &'static str {
        match self {
            Hook::Register => "onRegister",
            Hook::ServerStart => "onServerStart",
            Hook::ServerReady => "onServerReady",
            Hook::ServerStop => "onServerStop",
            Hook::Request => "onRequest",
            Hook::Response => "onResponse",
            Hook::Error => "onError",
            Hook::SecurityThreat => "onSecurityThreat",
            Hook::RateLimit => "onRateLimit",
            Hook::RequestTiming => "onRequestTiming",
            Hook::RouteError => "onRouteError",
            Hook::PerformanceMetrics => "onPerformanceMetrics",
            Hook::ConsoleIntercept => "onConsoleIntercept",
            Hook::RegisterRoutes => "registerRoutes",
        }
    }
}

/// Where a plugin sits relative to the rest of the chain.
///
/// The chain is partitioned First / Normal / Last; registration order is
/// preserved within each bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginPriority {
    First,
    Normal,
    Last,
}

/// A detected security threat, forwarded to `onSecurityThreat`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreatInfo {
    pub kind: String,
    pub detail: String,
}

/// Rate-limit verdict details, forwarded to `onRateLimit` before the 429 is
/// written.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    /// Unix milliseconds when the current window resets.
    pub reset_ms: i64,
}

/// Wall-clock summary for one request, forwarded to `onRequestTiming`.
#[derive(Debug, Clone, Serialize)]
pub struct RequestTiming {
    pub total_ms: u64,
    pub hook_ms: u64,
    pub handler_ms: u64,
}

/// Routing-stage failure details, forwarded to `onRouteError`.
#[derive(Debug, Clone, Serialize)]
pub struct RouteErrorInfo {
    pub status: u16,
    pub path: String,
    pub method: String,
}

/// Aggregate process metrics, forwarded to `onPerformanceMetrics`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PerformanceSnapshot {
    pub requests_total: u64,
    pub errors_total: u64,
    pub in_flight: u64,
    pub avg_latency_ms: f64,
}

/// Error raised inside a hook. Hook failures are the one place the pipeline
/// propagates like an exception: the runtime catches them and feeds the
/// error chain.
#[derive(Debug, Clone)]
pub struct HookError {
    pub plugin: String,
    pub message: String,
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plugin {}: {}", self.plugin, self.message)
    }
}

impl From<HookError> for HandlerError {
    fn from(err: HookError) -> Self {
        HandlerError::Failed {
            message: err.to_string(),
        }
    }
}

/// A pipeline participant. Every hook has a default no-op body; implement
/// only what the plugin actually intercepts.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn priority(&self) -> PluginPriority {
        PluginPriority::Normal
    }

    /// Route additions contributed by the plugin, spliced in before start.
    fn register_routes(&self, _router: &mut AppRouter) {}

    async fn on_register(&self) {}

    async fn on_server_start(&self) {}

    async fn on_server_ready(&self) {}

    async fn on_server_stop(&self) {}

    /// Pre-routing interception. Returning `Respond` short-circuits the
    /// pipeline; the response skips routing and the handler.
    async fn on_request(&self, _req: &mut Request) -> Result<HookFlow, HookError> {
        Ok(HookFlow::Continue)
    }

    /// Post-handler interception; may rewrite the outgoing response.
    async fn on_response(&self, _req: &Request, _res: &mut Response) -> Result<(), HookError> {
        Ok(())
    }

    /// Error interception, run in reverse chain order. The first plugin to
    /// return a response wins.
    async fn on_error(
        &self,
        _err: &HandlerError,
        _req: &Request,
    ) -> Result<Option<Response>, HookError> {
        Ok(None)
    }

    async fn on_security_threat(&self, _threat: &ThreatInfo, _peer_ip: &str, _path: &str) {}

    async fn on_rate_limit(&self, _info: &RateLimitInfo, _peer_ip: &str, _path: &str) {}

    async fn on_request_timing(&self, _timing: &RequestTiming, _req: &Request, _res: &Response) {}

    async fn on_route_error(&self, _info: &RouteErrorInfo, _req: &Request) {}

    async fn on_performance_metrics(&self, _metrics: &PerformanceSnapshot) {}

    /// Framework log line interception; only plugins granted the
    /// `onConsoleIntercept` permission ever see these.
    fn on_console_intercept(&self, _line: &str) {}
}
