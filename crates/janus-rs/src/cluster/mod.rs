//! Worker process lifecycle: spawn, schedule, limit, respawn, drain.
//!
//! - [`registry`] - Ready-worker snapshots and request scheduling
//! - [`limits`] - /proc sampling and pre-exec resource limits
//! - [`supervisor`] - Spawn/respawn, restart-storm protection, shutdown

pub mod limits;
pub mod registry;
pub mod supervisor;

pub use registry::WorkerRegistry;
pub use supervisor::{Supervisor, SupervisorError, WorkerState};
