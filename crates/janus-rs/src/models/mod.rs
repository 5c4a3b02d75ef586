//! Data models and domain types for the Janus framework.
//!
//! - [`error`] - Gateway error taxonomy with HTTP response mapping
//! - [`settings`] - The full configuration document and its validation
//!
//! All models are serde-serializable, validated before use, and never
//! mutated after `start`.

pub mod error;
pub mod settings;
