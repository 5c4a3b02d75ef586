//! Request routing: radix-tree pattern matching on `(method, path)`.
//!
//! Patterns support four segment forms, in match precedence order at each
//! depth: exact static text, `:name` parameters, the single-segment wildcard
//! `*`, and the terminal multi-segment wildcard `**`. The tree is built at
//! registration time and traversed read-only while serving, so no locks are
//! involved on the hot path.
//!
//! The table is generic over its leaf value: the worker runtime stores
//! handler chains, the gateway stores route classifications (timeout
//! overrides, proxy targets) in the same structure so both sides agree on
//! pattern semantics.

pub mod radix;

pub use radix::{RouteLookup, RouteParams, RouteTable, RouterError};
