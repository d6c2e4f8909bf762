//! # Dispatcher Configuration
//!
//! Settings are layered the same way for every consumer:
//!
//! 1. built-in defaults,
//! 2. an optional JSON file (camelCase keys),
//! 3. `FETCH_*` environment variables,
//! 4. explicit overrides (for example command-line flags).
//!
//! Each layer is a [`PartialDispatcherConfig`] whose `Some` fields win over
//! the layer below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of concurrent workers.
pub const ENV_WORKERS: &str = "FETCH_WORKERS";
/// `true`/`false`: disable live fetches.
pub const ENV_CACHE_ONLY: &str = "FETCH_CACHE_ONLY";
/// Default per-request timeout in milliseconds (`0` = unbounded).
pub const ENV_DEFAULT_TIMEOUT_MS: &str = "FETCH_DEFAULT_TIMEOUT_MS";
/// Connect timeout in milliseconds (`0` = unbounded).
pub const ENV_CONNECT_TIMEOUT_MS: &str = "FETCH_CONNECT_TIMEOUT_MS";
/// Transient-failure retries per live fetch.
pub const ENV_MAX_RETRIES: &str = "FETCH_MAX_RETRIES";
/// `User-Agent` header value.
pub const ENV_USER_AGENT: &str = "FETCH_USER_AGENT";
/// Base directory for relative cache files.
pub const ENV_CACHE_DIR: &str = "FETCH_CACHE_DIR";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        /// The config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for this schema.
    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        /// The config file.
        path: PathBuf,
        /// The parser error.
        #[source]
        source: serde_json::Error,
    },
    /// An environment variable holds a value of the wrong type.
    #[error("invalid value '{value}' for {key}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// The offending value.
        value: String,
    },
}

/// One configuration layer. `None` fields defer to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialDispatcherConfig {
    /// See [`DispatcherConfig::worker_count`].
    pub worker_count: Option<usize>,
    /// See [`DispatcherConfig::cache_only`].
    pub cache_only: Option<bool>,
    /// See [`DispatcherConfig::default_timeout_ms`].
    pub default_timeout_ms: Option<u64>,
    /// See [`DispatcherConfig::connect_timeout_ms`].
    pub connect_timeout_ms: Option<u64>,
    /// See [`DispatcherConfig::max_retries`].
    pub max_retries: Option<u32>,
    /// See [`DispatcherConfig::user_agent`].
    pub user_agent: Option<String>,
    /// See [`DispatcherConfig::cache_dir`].
    pub cache_dir: Option<PathBuf>,
}

impl PartialDispatcherConfig {
    /// Merges two layers, where `other` overrides `self` for `Some` values.
    pub fn merge(self, other: PartialDispatcherConfig) -> PartialDispatcherConfig {
        PartialDispatcherConfig {
            worker_count: other.worker_count.or(self.worker_count),
            cache_only: other.cache_only.or(self.cache_only),
            default_timeout_ms: other.default_timeout_ms.or(self.default_timeout_ms),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            max_retries: other.max_retries.or(self.max_retries),
            user_agent: other.user_agent.or(self.user_agent),
            cache_dir: other.cache_dir.or(self.cache_dir),
        }
    }

    /// Reads a JSON layer. A missing file yields `Ok(None)`.
    pub fn from_json_file(path: &Path) -> Result<Option<PartialDispatcherConfig>, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Reads the `FETCH_*` environment variables.
    pub fn from_env() -> Result<PartialDispatcherConfig, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a layer from any key lookup, using the `FETCH_*` names.
    pub fn from_lookup<F>(lookup: F) -> Result<PartialDispatcherConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Ok(PartialDispatcherConfig {
            worker_count: parse_var(ENV_WORKERS, get(ENV_WORKERS))?,
            cache_only: get(ENV_CACHE_ONLY).map(|v| parse_flag(ENV_CACHE_ONLY, &v)).transpose()?,
            default_timeout_ms: parse_var(ENV_DEFAULT_TIMEOUT_MS, get(ENV_DEFAULT_TIMEOUT_MS))?,
            connect_timeout_ms: parse_var(ENV_CONNECT_TIMEOUT_MS, get(ENV_CONNECT_TIMEOUT_MS))?,
            max_retries: parse_var(ENV_MAX_RETRIES, get(ENV_MAX_RETRIES))?,
            user_agent: get(ENV_USER_AGENT),
            cache_dir: get(ENV_CACHE_DIR).map(PathBuf::from),
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    value
        .map(|v| {
            v.parse::<T>().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: v.clone(),
            })
        })
        .transpose()
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

/// # Dispatcher Configuration
///
/// Fully resolved settings of a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherConfig {
    /// Size of the worker pool. Never below 1.
    pub worker_count: usize,
    /// When set, no live fetch is attempted and every live fetch counts as failed.
    pub cache_only: bool,
    /// Timeout for requests that do not set their own; `0` means unbounded.
    pub default_timeout_ms: u64,
    /// Connect timeout of the HTTP client; `0` means unbounded.
    pub connect_timeout_ms: u64,
    /// Transient-failure retries per live fetch; `0` disables retrying.
    pub max_retries: u32,
    /// `User-Agent` sent with every live fetch.
    pub user_agent: String,
    /// Base directory for relative cache file paths.
    pub cache_dir: Option<PathBuf>,
}

impl Default for DispatcherConfig {
    /// Four workers, live fetches enabled, no read timeout, a 10 second connect timeout.
    fn default() -> Self {
        Self {
            worker_count: 4,
            cache_only: false,
            default_timeout_ms: 0,
            connect_timeout_ms: 10_000,
            max_retries: 0,
            user_agent: concat!("lib_fetch/", env!("CARGO_PKG_VERSION")).to_string(),
            cache_dir: None,
        }
    }
}

impl DispatcherConfig {
    /// Applies a layer on top of this configuration.
    pub fn with_overrides(self, layer: PartialDispatcherConfig) -> DispatcherConfig {
        DispatcherConfig {
            worker_count: layer.worker_count.unwrap_or(self.worker_count).max(1),
            cache_only: layer.cache_only.unwrap_or(self.cache_only),
            default_timeout_ms: layer.default_timeout_ms.unwrap_or(self.default_timeout_ms),
            connect_timeout_ms: layer.connect_timeout_ms.unwrap_or(self.connect_timeout_ms),
            max_retries: layer.max_retries.unwrap_or(self.max_retries),
            user_agent: layer.user_agent.unwrap_or(self.user_agent),
            cache_dir: layer.cache_dir.or(self.cache_dir),
        }
    }

    /// Loads defaults, then the optional JSON file, then the environment.
    pub fn load(config_file: Option<&Path>) -> Result<DispatcherConfig, ConfigError> {
        let mut layer = PartialDispatcherConfig::default();

        if let Some(path) = config_file {
            match PartialDispatcherConfig::from_json_file(path)? {
                Some(file_layer) => layer = layer.merge(file_layer),
                None => log::info!(
                    "Config file not found at {}. Using defaults and environment variables.",
                    path.display()
                ),
            }
        }

        layer = layer.merge(PartialDispatcherConfig::from_env()?);
        Ok(DispatcherConfig::default().with_overrides(layer))
    }

    /// The default per-request timeout, `None` when unbounded.
    pub fn default_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.default_timeout_ms)
    }

    /// The connect timeout, `None` when unbounded.
    pub fn connect_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.connect_timeout_ms)
    }

    /// Resolves a request's cache file against `cache_dir`. Absolute paths are kept.
    pub fn resolve_cache_path(&self, path: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
