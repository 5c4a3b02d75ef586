//! Gateway error taxonomy with HTTP response mapping.
//!
//! Every failure the gateway can surface to a client is an explicit variant
//! here, grouped by origin: admission, resilience, transport, application.
//! Configuration and platform failures are fatal at startup and never reach
//! this type. Responses carry a JSON body of the shape
//! `{"error": <kind>, "message": <safe>, "requestId": <id>}`; stack traces
//! and internal detail stay in the server log.

use actix_web::{http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the gateway while admitting, dispatching, or proxying
/// a request.
///
/// Each variant maps to exactly one HTTP status. The `kind()` string is the
/// stable machine-readable identifier used in response bodies and logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// Declared or observed body size exceeds the configured limit.
    #[error("Request body exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: usize },

    /// Request URL is longer than the configured maximum.
    #[error("Request URL exceeds the {limit} byte limit")]
    UrlTooLong { limit: usize },

    /// The admission queue is full, or the request waited out its queue slot.
    #[error("Server is at capacity")]
    QueueFull,

    /// Per-client concurrency cap reached.
    #[error("Too many concurrent requests from this client")]
    PerIpExceeded { limit: usize },

    /// Fixed-window rate limit exceeded for the client's key.
    #[error("Rate limit exceeded, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    /// The network-quality gate rejected the connection.
    #[error("Connection quality below configured threshold: {reason}")]
    QualityRejected { reason: String },

    /// Circuit breaker for the target is open.
    #[error("Circuit breaker open for {service}")]
    CircuitOpen { service: String },

    /// Upstream could not be reached or returned a transport-level error.
    #[error("Upstream error for {url}: {message}")]
    Upstream { url: String, message: String },

    /// All retry attempts were exhausted without a usable response.
    #[error("Upstream failed after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The request deadline elapsed before a response was produced.
    #[error("Request deadline of {timeout_ms} ms exceeded")]
    Timeout { timeout_ms: u64 },

    /// The IPC peer (worker or vault) died or the channel broke mid-request.
    #[error("Worker channel lost")]
    IpcPeerDead,

    /// The IPC byte stream violated the frame protocol.
    #[error("IPC protocol violation: {message}")]
    IpcCodec { message: String },

    /// No worker is ready to take the request.
    #[error("No ready worker available")]
    NoWorker,

    /// Every configured upstream is unhealthy.
    #[error("No healthy upstream available")]
    NoUpstream,

    /// No route matches the request path.
    #[error("No route matches {path}")]
    RouteNotFound { path: String },

    /// A route exists for the path but not for this method.
    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed {
        method: String,
        path: String,
        allow: Vec<String>,
    },

    /// A handler or plugin failed; the id pairs the response with a log line.
    #[error("Internal error {error_id}")]
    Handler { error_id: String },

    /// The server is draining and no longer accepts work.
    #[error("Server is shutting down")]
    ShuttingDown,
}

impl GatewayError {
    /// Stable machine-readable kind, used as the `error` field of response
    /// bodies. These strings are part of the public surface; do not rename.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::PayloadTooLarge { .. } => "payload-too-large",
            GatewayError::UrlTooLong { .. } => "url-too-long",
            GatewayError::QueueFull => "queue-full",
            GatewayError::PerIpExceeded { .. } => "per-ip-exceeded",
            GatewayError::RateLimited { .. } => "rate-limited",
            GatewayError::QualityRejected { .. } => "quality-rejected",
            GatewayError::CircuitOpen { .. } => "breaker-open",
            GatewayError::Upstream { .. } => "upstream-unreachable",
            GatewayError::RetriesExhausted { .. } => "retry-exhausted",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::IpcPeerDead => "ipc-peer-dead",
            GatewayError::IpcCodec { .. } => "ipc-codec-error",
            GatewayError::NoWorker => "no-worker",
            GatewayError::NoUpstream => "upstream-unavailable",
            GatewayError::RouteNotFound { .. } => "not-found",
            GatewayError::MethodNotAllowed { .. } => "method-not-allowed",
            GatewayError::Handler { .. } => "handler-error",
            GatewayError::ShuttingDown => "shutting-down",
        }
    }

    /// HTTP status code this error renders as.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::UrlTooLong { .. } => StatusCode::URI_TOO_LONG,
            GatewayError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::PerIpExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::QualityRejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::RetriesExhausted { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::IpcPeerDead => StatusCode::BAD_GATEWAY,
            GatewayError::IpcCodec { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::NoWorker => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NoUpstream => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Handler { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Builds the client-facing response, stamping the given request id.
    ///
    /// The 405 variant additionally carries the `Allow` header, and the
    /// rate-limit variant a `Retry-After` hint.
    pub fn to_response(&self, request_id: &str) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status());
        match self {
            GatewayError::MethodNotAllowed { allow, .. } => {
                builder.insert_header(("Allow", allow.join(", ")));
            }
            GatewayError::RateLimited { retry_after_ms } => {
                builder.insert_header(("Retry-After", (retry_after_ms / 1000).max(1).to_string()));
            }
            _ => {}
        }
        builder.insert_header(("X-Request-Id", request_id));
        builder.json(json!({
            "error": self.kind(),
            "message": self.to_string(),
            "requestId": request_id,
        }))
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        // Fallback path for errors that escape the catch-all handler; a fresh
        // id still lets the response be paired with the log line.
        self.to_response(&Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(GatewayError::QueueFull.kind(), "queue-full");
        assert_eq!(
            GatewayError::Timeout { timeout_ms: 100 }.kind(),
            "timeout"
        );
        assert_eq!(GatewayError::IpcPeerDead.kind(), "ipc-peer-dead");
    }

    #[test]
    fn statuses_match_taxonomy() {
        assert_eq!(
            GatewayError::PayloadTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            GatewayError::UrlTooLong { limit: 1 }.status(),
            StatusCode::URI_TOO_LONG
        );
        assert_eq!(GatewayError::IpcPeerDead.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::Timeout { timeout_ms: 1 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn method_not_allowed_carries_allow_header() {
        let err = GatewayError::MethodNotAllowed {
            method: "POST".to_string(),
            path: "/x".to_string(),
            allow: vec!["GET".to_string(), "HEAD".to_string()],
        };
        let resp = err.to_response("req-1");
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let allow = resp.headers().get("Allow").unwrap();
        assert_eq!(allow.to_str().unwrap(), "GET, HEAD");
    }
}
