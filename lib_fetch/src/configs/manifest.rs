//! # Request Manifests
//!
//! A manifest is a JSON array of [`RequestSpec`]s. It carries everything a
//! request needs except its callbacks, which the consumer supplies when it
//! turns a spec into a [`RequestBuilder`].
//!
//! ```json
//! [
//!   { "id": "items", "url": "https://example.com/items.json",
//!     "group": 0, "cacheFile": "items.json", "useCacheAsBackup": true },
//!   { "id": "prices", "url": "https://example.com/prices.json", "group": 1,
//!     "sha256": "ba7816bf...", "timeoutMs": 5000 }
//! ]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::request::{Request, RequestBuilder};

/// Errors raised while loading a manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The manifest file could not be read.
    #[error("failed to read manifest {}: {source}", .path.display())]
    Io {
        /// The manifest file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The manifest is not a JSON array of request specs.
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    /// An entry has an empty id.
    #[error("manifest entry #{index} has an empty id")]
    EmptyId {
        /// Zero-based position in the manifest.
        index: usize,
    },
}

/// One request as described in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    /// Request identity.
    pub id: String,
    /// Absolute URL of the live fetch.
    pub url: String,
    /// Ordering group.
    #[serde(default)]
    pub group: u32,
    /// Cache file, relative paths resolve against the configured cache dir.
    #[serde(default)]
    pub cache_file: Option<PathBuf>,
    /// Fall back to the cache file when the live fetch fails.
    #[serde(default)]
    pub use_cache_as_backup: bool,
    /// Expected SHA-256 (hex) of a cache file that may be used without fetching.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Per-request timeout, `0` for unbounded.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RequestSpec {
    /// A builder with everything but the callbacks filled in.
    pub fn builder(&self) -> RequestBuilder {
        let mut builder = Request::builder(self.id.clone(), self.url.clone()).group(self.group);
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.clone());
        }
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(path) = &self.cache_file {
            builder = builder.cache_to(path.clone());
        }
        if self.use_cache_as_backup {
            builder = builder.use_cache_as_backup();
        }
        if let Some(digest) = &self.sha256 {
            builder = builder.cache_sha256(digest);
        }
        builder
    }
}

/// Parses manifest text.
pub fn parse_manifest(text: &str) -> Result<Vec<RequestSpec>, ManifestError> {
    let specs: Vec<RequestSpec> = serde_json::from_str(text)?;
    if let Some(index) = specs.iter().position(|spec| spec.id.trim().is_empty()) {
        return Err(ManifestError::EmptyId { index });
    }
    Ok(specs)
}

/// Reads and parses a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<RequestSpec>, ManifestError> {
    let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::sha256_hex;

    #[test]
    fn parse_applies_defaults() {
        let specs = parse_manifest(r#"[{ "id": "a", "url": "https://example.com/a" }]"#).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].group, 0);
        assert!(!specs[0].use_cache_as_backup);
        assert!(specs[0].cache_file.is_none());
        assert!(specs[0].headers.is_empty());
    }

    #[test]
    fn parse_rejects_empty_ids() {
        let err = parse_manifest(
            r#"[{ "id": "a", "url": "https://example.com/a" }, { "id": " ", "url": "https://example.com/b" }]"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::EmptyId { index: 1 }));
    }

    #[test]
    fn parse_rejects_non_arrays() {
        assert!(matches!(parse_manifest("{}"), Err(ManifestError::Parse(_))));
    }

    #[test]
    fn spec_builder_carries_all_settings() {
        let digest = sha256_hex(b"cached");
        let text = format!(
            r#"[{{ "id": "b", "url": "https://example.com/b", "group": 2,
                 "cacheFile": "b.json", "useCacheAsBackup": true,
                 "sha256": "{}", "timeoutMs": 0, "headers": {{ "Accept": "application/json" }} }}]"#,
            digest
        );
        let specs = parse_manifest(&text).unwrap();

        let request = specs[0].builder().handle(|_, _| true).build().unwrap();
        assert_eq!(request.id(), "b");
        assert_eq!(request.group(), 2);
        assert_eq!(request.cache_file(), Some(Path::new("b.json")));
        assert!(request.use_cache_as_backup());
        assert!(request.validate_cache(b"cached"));
        assert!(!request.validate_cache(b"stale"));
        assert_eq!(request.resolved_target(Some(Duration::from_secs(3))).timeout, None);
    }

    #[test]
    fn load_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }
}
