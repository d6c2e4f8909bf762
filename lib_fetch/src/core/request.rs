//! # Request Model
//!
//! A [`Request`] is a declarative description of one network fetch: an identity
//! used for de-duplication, an ordering group, the HTTP target, an optional
//! cache file and the callbacks that decide whether fetched or cached bytes
//! satisfy it. Requests are immutable once built; the dispatcher keeps their
//! lifecycle status ([`LoadingPhase`]) next to them in its registry.
//!
//! Callbacks are plain `Arc<dyn Fn ...>` values so a request can be shared
//! between the registry and the worker task that processes it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::cache::sha256_validator;
use crate::retrieve::http_fetch::{FetchError, FetchTarget, ResponseMeta};

/// Interprets a payload. `None` metadata means the bytes came from the cache.
///
/// `Ok(true)` accepts the payload, `Ok(false)` rejects it and `Err(_)` reports
/// that the handler itself failed.
pub type Handler =
    Arc<dyn Fn(Option<&ResponseMeta>, &[u8]) -> anyhow::Result<bool> + Send + Sync>;

/// Decides whether cached bytes may be used without a network call.
pub type CacheValidator = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Called once per dispatch when no path could satisfy the request.
pub type ErrorCallback = Arc<dyn Fn(&RequestError) + Send + Sync>;

/// # Loading Phase
///
/// Lifecycle marker of a pending request. Only the dispatcher mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadingPhase {
    /// Registered and waiting for the next dispatch cycle.
    Unloaded,
    /// Claimed by a running dispatch cycle.
    ToLoad,
    /// The worker task for this request has finished, whatever the outcome.
    Loaded,
}

/// Why the live fetch did not satisfy a request.
#[derive(Debug, Clone, Error)]
pub enum LiveFailure {
    /// Live fetches are disabled by configuration.
    #[error("live fetches are disabled (cache-only mode)")]
    CacheOnly,
    /// The HTTP exchange itself failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// The handler returned `false` for the response body.
    #[error("handler rejected the response body")]
    Rejected,
    /// The handler returned an error or panicked on the response body.
    #[error("handler failed on the response body: {0}")]
    Handler(String),
}

/// # Request Error
///
/// The terminal failure handed to a request's `on_error` callback. Every
/// variant carries the live failure that started the fallback chain.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// The live fetch failed and the request does not use its cache as backup.
    #[error("request was not satisfied and using cache as backup is not set ({live})")]
    NoBackup {
        /// What went wrong with the live fetch.
        live: LiveFailure,
    },
    /// The live fetch failed and there is no cache file to fall back to.
    #[error("cache backup file is missing ({live})")]
    BackupMissing {
        /// What went wrong with the live fetch.
        live: LiveFailure,
    },
    /// The cached bytes were handed to the handler and it did not accept them.
    #[error("cache backup is invalid ({live})")]
    BackupRejected {
        /// What went wrong with the live fetch.
        live: LiveFailure,
    },
    /// The cache file exists but could not be read.
    #[error("cache backup could not be read: {reason} ({live})")]
    BackupUnreadable {
        /// What went wrong with the live fetch.
        live: LiveFailure,
        /// The I/O failure on the cache file.
        reason: String,
    },
}

impl RequestError {
    /// The live failure that led to this error.
    pub fn live_failure(&self) -> &LiveFailure {
        match self {
            RequestError::NoBackup { live }
            | RequestError::BackupMissing { live }
            | RequestError::BackupRejected { live }
            | RequestError::BackupUnreadable { live, .. } => live,
        }
    }
}

/// Errors raised by [`RequestBuilder::build`].
#[derive(Debug, Error)]
pub enum RequestBuildError {
    /// The URL is not an absolute URL.
    #[error("invalid URL '{url}' for request '{id}': {source}")]
    InvalidUrl {
        /// Request id.
        id: String,
        /// The rejected URL text.
        url: String,
        /// Parser error.
        #[source]
        source: url::ParseError,
    },
    /// A header name or value is not valid HTTP.
    #[error("invalid header '{name}' for request '{id}'")]
    InvalidHeader {
        /// Request id.
        id: String,
        /// The offending header name.
        name: String,
    },
    /// No handler was supplied.
    #[error("request '{id}' has no handler")]
    MissingHandler {
        /// Request id.
        id: String,
    },
}

/// # Request
///
/// One unit of fetch-or-cache work. Build it with [`Request::builder`].
pub struct Request {
    id: String,
    group: u32,
    target: FetchTarget,
    timeout: Option<Duration>,
    cache_file: Option<PathBuf>,
    cache_validator: Option<CacheValidator>,
    handler: Handler,
    use_cache_as_backup: bool,
    on_error: Option<ErrorCallback>,
}

impl Request {
    /// Starts a builder for a request with the given identity and URL.
    pub fn builder(id: impl Into<String>, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(id, url)
    }

    /// Identity used for de-duplication.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Ordering group. Lower groups finish before higher groups start.
    pub fn group(&self) -> u32 {
        self.group
    }

    /// The URL of the live fetch.
    pub fn url(&self) -> &Url {
        &self.target.url
    }

    /// Cache file as given to the builder (before cache-dir resolution).
    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    /// Whether cached bytes are tried after a failed live fetch.
    pub fn use_cache_as_backup(&self) -> bool {
        self.use_cache_as_backup
    }

    /// Whether a cache validator was configured.
    pub fn has_cache_validator(&self) -> bool {
        self.cache_validator.is_some()
    }

    /// Builds the fetch target, resolving the timeout.
    ///
    /// The request's own timeout wins over `default_timeout`; a zero duration
    /// from either source means no timeout at all.
    pub(crate) fn resolved_target(&self, default_timeout: Option<Duration>) -> FetchTarget {
        let mut target = self.target.clone();
        target.timeout = self
            .timeout
            .or(default_timeout)
            .filter(|timeout| !timeout.is_zero());
        target
    }

    /// Runs the cache validator. A panicking validator counts as a rejection.
    pub(crate) fn validate_cache(&self, bytes: &[u8]) -> bool {
        let Some(validator) = &self.cache_validator else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| validator(bytes))) {
            Ok(valid) => valid,
            Err(payload) => {
                log::error!(
                    "Cache validator for {} panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                );
                false
            }
        }
    }

    /// Runs the handler, folding errors and panics into `Err(reason)`.
    pub(crate) fn invoke_handler(
        &self,
        meta: Option<&ResponseMeta>,
        bytes: &[u8],
    ) -> Result<bool, String> {
        match catch_unwind(AssertUnwindSafe(|| (self.handler)(meta, bytes))) {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(payload) => Err(format!("handler panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    /// Delivers a terminal failure to `on_error`.
    pub(crate) fn report_error(&self, error: &RequestError) {
        let Some(on_error) = &self.on_error else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| on_error(error))) {
            log::error!(
                "Error callback for {} panicked: {}",
                self.id,
                panic_message(payload.as_ref())
            );
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("method", &self.target.method)
            .field("url", &self.target.url.as_str())
            .field("timeout", &self.timeout)
            .field("cache_file", &self.cache_file)
            .field("cache_validator", &self.cache_validator.is_some())
            .field("use_cache_as_backup", &self.use_cache_as_backup)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// # Request Builder
///
/// Fluent construction of a [`Request`].
///
/// # Example
/// ```rust
/// use lib_fetch::Request;
///
/// let request = Request::builder("items", "https://example.com/items.json")
///     .group(1)
///     .cache_to("items.json")
///     .use_cache_as_backup()
///     .handle_json(|items: Vec<String>| !items.is_empty())
///     .build()
///     .unwrap();
/// assert_eq!(request.id(), "items");
/// ```
pub struct RequestBuilder {
    id: String,
    url: String,
    group: u32,
    method: Method,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    cache_file: Option<PathBuf>,
    cache_validator: Option<CacheValidator>,
    handler: Option<Handler>,
    use_cache_as_backup: bool,
    on_error: Option<ErrorCallback>,
}

impl RequestBuilder {
    /// Creates a builder for a GET request in group 0.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            group: 0,
            method: Method::GET,
            headers: Vec::new(),
            timeout: None,
            cache_file: None,
            cache_validator: None,
            handler: None,
            use_cache_as_backup: false,
            on_error: None,
        }
    }

    /// Sets the ordering group.
    pub fn group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Sets the HTTP method.
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a request header. Invalid names or values fail at `build`.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides the dispatcher's default timeout. `Duration::ZERO` disables it.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Persists accepted live payloads to `path` and reads cached data from it.
    pub fn cache_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// Falls back to the cache file when the live fetch fails.
    pub fn use_cache_as_backup(mut self) -> Self {
        self.use_cache_as_backup = true;
        self
    }

    /// Lets cached bytes satisfy the request without a network call when
    /// `validator` accepts them.
    pub fn cache_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + Sync + 'static,
    {
        self.cache_validator = Some(Arc::new(validator));
        self
    }

    /// Cache validator that accepts bytes whose SHA-256 digest matches `expected_hex`.
    pub fn cache_sha256(mut self, expected_hex: &str) -> Self {
        self.cache_validator = Some(sha256_validator(expected_hex));
        self
    }

    /// Sets an infallible handler.
    pub fn handle<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&ResponseMeta>, &[u8]) -> bool + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(
            move |meta: Option<&ResponseMeta>, bytes: &[u8]| -> anyhow::Result<bool> {
                Ok(handler(meta, bytes))
            },
        ));
        self
    }

    /// Sets a fallible handler. Errors are logged and treated as failures.
    pub fn try_handle<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&ResponseMeta>, &[u8]) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets a handler that receives the payload deserialized from JSON.
    /// A payload that does not parse as `T` is a handler failure.
    pub fn handle_json<T, F>(mut self, handler: F) -> Self
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> bool + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(
            move |_meta: Option<&ResponseMeta>, bytes: &[u8]| -> anyhow::Result<bool> {
                let value: T = serde_json::from_slice(bytes)
                    .context("payload does not match the expected JSON shape")?;
                Ok(handler(value))
            },
        ));
        self
    }

    /// Sets the callback invoked when the request cannot be satisfied.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&RequestError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Validates the URL and headers and produces the request.
    pub fn build(self) -> Result<Request, RequestBuildError> {
        let url = Url::parse(&self.url).map_err(|source| RequestBuildError::InvalidUrl {
            id: self.id.clone(),
            url: self.url.clone(),
            source,
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let invalid = || RequestBuildError::InvalidHeader {
                id: self.id.clone(),
                name: name.clone(),
            };
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| invalid())?;
            let header_value = HeaderValue::from_str(value).map_err(|_| invalid())?;
            headers.append(header_name, header_value);
        }

        let handler = self
            .handler
            .ok_or_else(|| RequestBuildError::MissingHandler { id: self.id.clone() })?;

        Ok(Request {
            id: self.id,
            group: self.group,
            target: FetchTarget {
                url,
                method: self.method,
                headers,
                timeout: None,
            },
            timeout: self.timeout,
            cache_file: self.cache_file,
            cache_validator: self.cache_validator,
            handler,
            use_cache_as_backup: self.use_cache_as_backup,
            on_error: self.on_error,
        })
    }
}
