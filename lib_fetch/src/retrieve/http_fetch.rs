//! # HTTP Retrieval Utilities
//!
//! The [`HttpFetcher`] trait is the only thing the dispatcher knows about the
//! network. [`ReqwestFetcher`] implements it on top of `reqwest`, wrapped in
//! `reqwest_middleware` so a retry policy can be layered on when configured.

use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use thiserror::Error;
use url::Url;

use crate::configs::config_dispatch::DispatcherConfig;

/// How to open a live fetch.
#[derive(Debug, Clone)]
pub struct FetchTarget {
    /// Absolute URL.
    pub url: Url,
    /// HTTP verb.
    pub method: Method,
    /// Extra request headers.
    pub headers: HeaderMap,
    /// Whole-exchange timeout. `None` waits until completion or a
    /// connection-level failure.
    pub timeout: Option<Duration>,
}

impl FetchTarget {
    /// A GET target without extra headers or timeout.
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            timeout: None,
        }
    }
}

/// Metadata of a live response, handed to request handlers.
#[derive(Debug, Clone)]
pub struct ResponseMeta {
    /// The final URL, after redirects.
    pub url: Url,
    /// The numeric HTTP status code.
    pub status: u16,
    /// The headers returned by the server.
    pub headers: HeaderMap,
}

/// A fully read live response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status line and headers.
    pub meta: ResponseMeta,
    /// The complete response body.
    pub body: Bytes,
}

/// # Fetch Error
///
/// Everything that can make a live fetch fail. All variants are treated alike
/// by the dispatcher: they trigger the cache-backup path or `on_error`.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The server answered with something other than `200 OK`.
    #[error("invalid response code {status}")]
    UnexpectedStatus {
        /// The status code received.
        status: u16,
    },
    /// The exchange exceeded its timeout.
    #[error("socket timeout (server may be down)")]
    Timeout,
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The body could not be read completely.
    #[error("failed to read response body: {0}")]
    Body(String),
    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Build(String),
    /// Any other transport or middleware failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            FetchError::Body(e.to_string())
        } else if e.is_builder() {
            FetchError::Build(e.to_string())
        } else {
            FetchError::Transport(e.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for FetchError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            reqwest_middleware::Error::Middleware(inner) => FetchError::Transport(format!("{:#}", inner)),
        }
    }
}

/// # HTTP Fetcher
///
/// The HTTP client contract of the dispatcher.
///
/// Implementations must:
/// - return [`FetchError::UnexpectedStatus`] for every status other than `200 OK`;
/// - read the whole body before returning;
/// - honour [`FetchTarget::timeout`], where `None` means no timeout.
pub trait HttpFetcher: Send + Sync {
    /// Performs one live fetch.
    fn fetch<'a>(&'a self, target: &'a FetchTarget) -> BoxFuture<'a, Result<FetchResponse, FetchError>>;
}

/// A `reqwest` based [`HttpFetcher`].
///
/// Built once and shared by every worker task so connections are pooled.
pub struct ReqwestFetcher {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
}

impl ReqwestFetcher {
    /// Creates a fetcher.
    ///
    /// # Arguments
    /// * `connect_timeout` - Limit for establishing a connection, `None` for no limit.
    /// * `user_agent` - Value of the `User-Agent` header.
    /// * `max_retries` - Transient-failure retries with exponential backoff; `0` disables them.
    ///
    /// # Errors
    /// Returns [`FetchError::Build`] if the TLS backend or client cannot be initialised.
    pub fn new(connect_timeout: Option<Duration>, user_agent: &str, max_retries: u32) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent);
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(|e| FetchError::Build(e.to_string()))?;

        let mut middleware = ClientBuilder::new(client);
        if max_retries > 0 {
            // Configure an exponential backoff policy for transient failures
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
            middleware = middleware.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: middleware.build(),
        })
    }

    /// Creates a fetcher from the connection settings of a [`DispatcherConfig`].
    pub fn from_config(config: &DispatcherConfig) -> Result<Self, FetchError> {
        Self::new(config.connect_timeout(), &config.user_agent, config.max_retries)
    }

    async fn execute(&self, target: &FetchTarget) -> Result<FetchResponse, FetchError> {
        // 1. Build the request with its headers and optional timeout
        let mut req = self
            .inner
            .request(target.method.clone(), target.url.clone())
            .headers(target.headers.clone());
        if let Some(timeout) = target.timeout {
            req = req.timeout(timeout);
        }

        // 2. Execute and check the status line before touching the body
        let response = req.send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::UnexpectedStatus {
                status: status.as_u16(),
            });
        }

        // 3. Capture metadata, then read the full body
        let meta = ResponseMeta {
            url: response.url().clone(),
            status: status.as_u16(),
            headers: response.headers().clone(),
        };
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Body(e.to_string())
            }
        })?;

        Ok(FetchResponse { meta, body })
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn fetch<'a>(&'a self, target: &'a FetchTarget) -> BoxFuture<'a, Result<FetchResponse, FetchError>> {
        Box::pin(self.execute(target))
    }
}
