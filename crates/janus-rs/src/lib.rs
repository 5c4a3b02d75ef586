//! # janus-rs
//!
//! Core library of the Janus hybrid HTTP application framework: a native
//! actix-web gateway in front of supervised application workers, joined by
//! a length-prefixed frame protocol over Unix sockets, with an encrypted
//! session vault sidecar (XEMS).
//!
//! ```text
//!   ┌─────────────────────────────┐        ┌──────────────────────────────┐
//!   │ Gateway (janus-gateway)     │  IPC   │ Worker(s) (janus-worker)     │
//!   │  admission | rate | quality │◄──────►│  plugins | router | handlers │
//!   │  proxy | breakers | retries │  UDS   │  session attach              │
//!   │  cluster supervisor         │ frames │        │                     │
//!   └─────────────────────────────┘        └────────┼─────────────────────┘
//!                                                   ▼
//!                                          ┌──────────────────┐
//!                                          │ Vault sidecar    │
//!                                          │ (janus-vault)    │
//!                                          └──────────────────┘
//! ```
//!
//! The binaries in this workspace are thin: all behavior lives here, module
//! by module, so applications can embed any slice of the stack.

pub mod cluster;
pub mod config;
pub mod gateway;
pub mod ipc;
pub mod logs;
pub mod models;
pub mod plugins;
pub mod protocol;
pub mod routing;
pub mod runtime;
pub mod services;
pub mod vault;
