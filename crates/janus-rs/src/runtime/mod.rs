//! The application runtime that lives inside a worker process.
//!
//! A worker receives decoded IPC requests, runs them through the plugin
//! pipeline and the radix router, executes the matched handler chain under a
//! deadline, and produces the response frame. Session attachment against the
//! vault sidecar happens here, transparently to handlers.
//!
//! - [`message`] - Request/response value structs and the handler capabilities
//! - [`app`] - Route registration, sub-router mounts, the built application
//! - [`dispatcher`] - The per-request state machine
//! - [`session`] - Vault-backed session attachment and auto-rotation

pub mod app;
pub mod dispatcher;
pub mod message;
pub mod session;

pub use app::{App, AppRouter};
pub use dispatcher::Dispatcher;
pub use message::{
    handler_fn, middleware_fn, Handler, HandlerChain, HandlerError, HookFlow, Middleware, Request,
    Response, Session,
};
