//! # Configuration Modules
//!
//! This module aggregates the configuration sources of the dispatcher: the
//! layered `DispatcherConfig` and the JSON request manifests consumed by the
//! `fetch-dispatch` binary.

/// Dispatcher settings layered from defaults, a JSON file and the environment.
pub mod config_dispatch;

/// JSON manifests describing batches of requests.
pub mod manifest;

pub use config_dispatch::{ConfigError, DispatcherConfig, PartialDispatcherConfig};
pub use manifest::{load_manifest, parse_manifest, ManifestError, RequestSpec};
