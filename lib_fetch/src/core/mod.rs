//! # Core Engine Module
//!
//! This module holds the request dispatch engine itself.
//!
//! ## Core Components:
//!
//! - **`request`**: The immutable `Request` value handed in by callers, its
//!   fluent `RequestBuilder`, the callback types and the error taxonomy that
//!   reaches a request's `on_error` callback.
//!
//! - **`registry`**: The pending-request registry. It de-duplicates requests
//!   by id, tracks each request's `LoadingPhase`, snapshots dispatch cycles and
//!   reconciles interrupted ones.
//!
//! - **`dispatcher`**: The public entry point. It turns the registry's
//!   snapshots into group-ordered, pool-bounded execution and implements the
//!   cache-first / live / cache-backup protocol for every request.

/// The pending-request registry shared by all dispatch cycles.
pub mod registry;
/// Request values, their builder and callback types.
pub mod request;
/// Group-ordered, pool-bounded execution of pending requests.
pub mod dispatcher;

// --- Public API Re-exports ---
pub use dispatcher::{CycleReport, Dispatcher, Resolution};
pub use request::{LoadingPhase, Request, RequestBuilder, RequestError};
