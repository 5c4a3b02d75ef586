//! Request and response value structs, and the handler capabilities.
//!
//! Requests and responses are plain values with no back-edges; the gateway
//! owns them during network I/O and the worker owns them for the handler
//! execution window. Handlers are a polymorphic capability: anything
//! implementing [`Handler`] can terminate a chain, anything implementing
//! [`Middleware`] can intercept and short-circuit it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::protocol::{RequestRecord, ResponseRecord};
use crate::routing::RouteParams;

/// A session attached to a request after a successful vault read.
#[derive(Debug, Clone)]
pub struct Session {
    /// The token the client presented.
    pub token: String,
    /// Decrypted payload, opaque to the framework.
    pub data: Bytes,
}

impl Session {
    /// Parses the payload as JSON, the common shape for session data.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.data).ok()
    }
}

/// One in-flight request inside a worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub peer_ip: String,
    /// Absolute deadline, Unix milliseconds. Handlers past it are cancelled
    /// at their next suspension point.
    pub deadline_ms: u64,
    /// Parameters bound by the router; empty until route match.
    pub params: RouteParams,
    /// Attached session, when the vault recognized the presented token.
    pub session: Option<Session>,
}

impl Request {
    /// Builds a request from its wire record and streamed body.
    pub fn from_record(correlation: Uuid, record: RequestRecord, body: Bytes) -> Self {
        Self {
            id: correlation,
            method: record.method,
            path: record.path,
            query: record.query,
            headers: record.headers,
            body,
            peer_ip: record.peer_ip,
            deadline_ms: record.deadline_ms,
            params: RouteParams::default(),
            session: None,
        }
    }

    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First query value matching `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Value of a cookie from the `Cookie` header, if present.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let header = self.header("cookie")?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then_some(v)
        })
    }

    /// Milliseconds until the deadline; zero when already past it.
    pub fn remaining_ms(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.deadline_ms.saturating_sub(now)
    }
}

/// The response a handler produces.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: Bytes::from(body.into()),
        }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(value.to_string()),
        }
    }

    /// Sets or replaces a header, case-insensitive on the name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (k, v) in self.headers.iter_mut() {
            if k.eq_ignore_ascii_case(name) {
                *v = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Wire record for the RESP frame; the body streams separately.
    pub fn to_record(&self) -> ResponseRecord {
        ResponseRecord {
            status: self.status,
            headers: self.headers.clone(),
        }
    }
}

/// Why a handler did not produce a response.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerError {
    /// The deadline passed or a CANCEL frame arrived; the runtime aborts at
    /// the next suspension point and answers 504.
    Cancelled,
    /// The handler failed. The message stays server-side; clients see an
    /// opaque error id.
    Failed { message: String },
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::Cancelled => write!(f, "cancelled"),
            HandlerError::Failed { message } => write!(f, "{}", message),
        }
    }
}

/// Control flow for interceptors: keep going, or answer now.
#[derive(Debug)]
pub enum HookFlow {
    Continue,
    Respond(Response),
}

/// Terminal request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, req: &mut Request) -> Result<Response, HandlerError>;
}

/// Route-level interceptor: runs before the handler, may short-circuit.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: &mut Request) -> Result<HookFlow, HandlerError>;
}

/// An ordered middleware chain ending in a handler.
#[derive(Clone)]
pub struct HandlerChain {
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub handler: Arc<dyn Handler>,
}

impl HandlerChain {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            middleware: Vec::new(),
            handler,
        }
    }

    /// Runs the chain: middleware in order, then the handler. A middleware
    /// that responds wins; its response skips the handler entirely.
    pub async fn run(&self, req: &mut Request) -> Result<Response, HandlerError> {
        for mw in &self.middleware {
            match mw.handle(req).await? {
                HookFlow::Continue => {}
                HookFlow::Respond(response) => return Ok(response),
            }
        }
        self.handler.handle(req).await
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: for<'a> Fn(
            &'a mut Request,
        )
            -> futures::future::BoxFuture<'a, Result<Response, HandlerError>>
        + Send
        + Sync,
{
    async fn handle(&self, req: &mut Request) -> Result<Response, HandlerError> {
        (self.0)(req).await
    }
}

/// Wraps a closure as a [`Handler`].
///
/// ```
/// use janus_rs::runtime::{handler_fn, Response};
///
/// let handler = handler_fn(|_req| {
///     Box::pin(async move { Ok(Response::text(200, "pong")) })
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F>(f: F) -> Arc<dyn Handler>
where
    F: for<'a> Fn(
            &'a mut Request,
        )
            -> futures::future::BoxFuture<'a, Result<Response, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnMiddleware<F>(F);

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(
            &'a mut Request,
        )
            -> futures::future::BoxFuture<'a, Result<HookFlow, HandlerError>>
        + Send
        + Sync,
{
    async fn handle(&self, req: &mut Request) -> Result<HookFlow, HandlerError> {
        (self.0)(req).await
    }
}

/// Wraps a closure as a [`Middleware`].
pub fn middleware_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(
            &'a mut Request,
        )
            -> futures::future::BoxFuture<'a, Result<HookFlow, HandlerError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request {
            id: Uuid::new_v4(),
            method: "GET".to_string(),
            path: "/".to_string(),
            query: vec![("page".to_string(), "2".to_string())],
            headers: vec![
                ("Cookie".to_string(), "a=1; janus_session=tok123".to_string()),
                ("X-Custom".to_string(), "yes".to_string()),
            ],
            body: Bytes::new(),
            peer_ip: "10.0.0.1".to_string(),
            deadline_ms: u64::MAX,
            params: RouteParams::default(),
            session: None,
        }
    }

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let req = request();
        assert_eq!(req.cookie("janus_session"), Some("tok123"));
        assert_eq!(req.cookie("a"), Some("1"));
        assert_eq!(req.cookie("missing"), None);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = request();
        assert_eq!(req.header("x-custom"), Some("yes"));
    }

    #[test]
    fn response_set_header_replaces_existing() {
        let mut resp = Response::text(200, "ok");
        resp.set_header("Content-Type", "application/json");
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.headers.len(), 1);
    }

    #[tokio::test]
    async fn chain_short_circuits_on_middleware_response() {
        let chain = HandlerChain {
            middleware: vec![middleware_fn(|_req| {
                Box::pin(async move { Ok(HookFlow::Respond(Response::text(401, "denied"))) })
            })],
            handler: handler_fn(|_req| {
                Box::pin(async move { Ok(Response::text(200, "never")) })
            }),
        };
        let mut req = request();
        let resp = chain.run(&mut req).await.unwrap();
        assert_eq!(resp.status, 401);
    }

    #[tokio::test]
    async fn chain_reaches_handler_when_middleware_continues() {
        let chain = HandlerChain {
            middleware: vec![middleware_fn(|req| {
                Box::pin(async move {
                    req.headers.push(("x-seen".to_string(), "1".to_string()));
                    Ok(HookFlow::Continue)
                })
            })],
            handler: handler_fn(|req| {
                let seen = req.header("x-seen").is_some();
                Box::pin(async move {
                    Ok(Response::text(200, if seen { "seen" } else { "unseen" }))
                })
            }),
        };
        let mut req = request();
        let resp = chain.run(&mut req).await.unwrap();
        assert_eq!(resp.body, Bytes::from_static(b"seen"));
    }
}
