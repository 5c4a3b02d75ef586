//! The IPC bridge between gateway and workers.
//!
//! One Unix stream socket per worker: the worker listens, the gateway
//! connects. Requests are correlated by the 16-byte frame id; within one
//! correlation frames are ordered, across correlations they interleave
//! freely. Body streaming is chunked under the configured window, with the
//! transport's own backpressure doing the flow control: a writer blocks
//! when the peer stops draining.
//!
//! - [`bridge`] - Gateway side: correlation table, deadlines, CANCEL, heartbeat
//! - [`listener`] - Worker side: frame loop feeding the dispatcher

pub mod bridge;
pub mod listener;

pub use bridge::WorkerBridge;
pub use listener::WorkerListener;
