//! # lib_fetch
//!
//! A request dispatch engine. Callers describe network fetches as [`Request`]s
//! (identity, ordering group, optional cache file, validator and handler
//! callbacks), hand them to a [`Dispatcher`], and trigger a dispatch cycle.
//! The dispatcher runs groups in ascending order, runs the requests of a group
//! concurrently on a bounded worker pool, and falls back to on-disk cached
//! content when the network fails.
//!
//! ## Modules
//!
//! - **`core`**: the request model, the pending registry and the dispatcher.
//! - **`retrieve`**: the HTTP client contract and its `reqwest` implementation.
//! - **`cache`**: cache file access and cache validators.
//! - **`configs`**: dispatcher configuration and JSON request manifests.
//! - **`loggers`** (feature `loggers`): console + file logger setup for binaries.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod cache;
pub mod configs;
pub mod core;
#[cfg(feature = "loggers")]
pub mod loggers;
pub mod retrieve;

// Re-export the types most callers need.
pub use crate::core::dispatcher::{CycleReport, Dispatcher, Resolution};
pub use crate::core::request::{
    LiveFailure, LoadingPhase, Request, RequestBuildError, RequestBuilder, RequestError,
};
pub use configs::config_dispatch::DispatcherConfig;
pub use retrieve::http_fetch::{
    FetchError, FetchResponse, FetchTarget, HttpFetcher, ReqwestFetcher, ResponseMeta,
};
