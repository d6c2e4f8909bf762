//! # Data Retrieval Module
//!
//! This module defines what the dispatcher needs from an HTTP client and
//! provides the default implementation.
//!
//! ## Contained Modules:
//!
//! - **`http_fetch`**: The `HttpFetcher` trait (issue a request, get a status
//!   code and the response bytes, honour a timeout) and `ReqwestFetcher`, built
//!   on `reqwest` and `reqwest-middleware` with an optional exponential
//!   backoff retry policy.
//!
//! Keeping the contract behind a trait lets tests script responses and count
//! fetch attempts without a network.

/// HTTP client contract and its `reqwest` implementation.
pub mod http_fetch;

pub use http_fetch::{FetchError, FetchResponse, FetchTarget, HttpFetcher, ReqwestFetcher, ResponseMeta};
