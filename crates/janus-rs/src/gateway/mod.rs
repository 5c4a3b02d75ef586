//! The native gateway: admission control, resilience, and dispatch.
//!
//! Incoming requests pass the admission gates in a fixed order with fast
//! rejection (URL length, body size, global concurrency with a bounded
//! FIFO queue, per-IP concurrency, rate limit, network quality) before the
//! catch-all handler classifies the route and either proxies it to an
//! upstream or ships it to a worker over the IPC bridge. Circuit breakers
//! guard the proxied targets; deadlines are enforced with CANCEL + 504.
//!
//! - [`admission`] - Gates 1-4 as an actix middleware
//! - [`rate_limit`] - Fixed-window limiter with `RateLimit-*` headers (gate 5)
//! - [`quality`] - Link-quality monitor and gate (gate 6)
//! - [`compression`] - Response compression policy
//! - [`handler`] - The catch-all: classify, proxy or dispatch, resiliency
//! - [`routes`] - Gateway-owned health endpoints

pub mod admission;
pub mod compression;
pub mod handler;
pub mod quality;
pub mod rate_limit;
pub mod routes;

pub use handler::GatewayHandler;
