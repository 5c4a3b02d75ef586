//! Logging setup for Janus binaries.

pub mod logger;
