//! XEMS: the encrypted session vault.
//!
//! Sessions live server-side as AES-256-GCM ciphertext under a per-process
//! master key; clients only ever hold opaque 256-bit tokens. The vault runs
//! as a sidecar process with a single-task event loop, so every operation is
//! linearizable without per-token locks. Workers talk to it over the frame
//! protocol on a dedicated Unix socket.
//!
//! - [`store`] - The in-memory encrypted store: create, read, rotate, destroy
//! - [`persistence`] - Optional `XEMSv1` snapshot bound to secret + host
//! - [`server`] - Sidecar event loop serving the store over IPC
//! - [`client`] - Worker-side handle speaking the same wire protocol

pub mod client;
pub mod persistence;
pub mod server;
pub mod store;

pub use client::VaultClient;
pub use store::{SessionVault, VaultConfig, VaultError};
