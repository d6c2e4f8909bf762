//! Cache file access.
//!
//! Writes go to a sibling `<name>.part` file which is renamed over the target
//! once complete, so readers only ever see whole payloads.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::request::CacheValidator;

/// Errors from cache file access.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache file does not exist.
    #[error("cache file {} does not exist", .0.display())]
    NotFound(PathBuf),
    /// Any other I/O failure.
    #[error("I/O error on cache file {}: {source}", .path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl CacheError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            CacheError::NotFound(path.to_path_buf())
        } else {
            CacheError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Reads a whole cache file.
pub async fn read_cache(path: &Path) -> Result<Vec<u8>, CacheError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| CacheError::from_io(path, e))
}

/// Writes `data` to `path`, creating parent directories as needed.
///
/// On failure the partial file is removed and `path` is left untouched.
pub async fn write_cache(path: &Path, data: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| CacheError::from_io(parent, e))?;
    }

    let part = part_path(path);
    if let Err(e) = tokio::fs::write(&part, data).await {
        remove_quietly(&part).await;
        return Err(CacheError::from_io(&part, e));
    }
    if let Err(e) = tokio::fs::rename(&part, path).await {
        remove_quietly(&part).await;
        return Err(CacheError::from_io(path, e));
    }
    Ok(())
}

/// Deletes a file, ignoring a missing file. Other failures are logged.
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("Deleted cache file {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not delete cache file {}: {}", path.display(), e),
    }
}

/// Lower-case hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A validator accepting bytes whose SHA-256 digest equals `expected_hex`
/// (case-insensitive).
pub fn sha256_validator(expected_hex: &str) -> CacheValidator {
    let expected = expected_hex.trim().to_ascii_lowercase();
    Arc::new(move |data: &[u8]| sha256_hex(data) == expected)
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("cache"));
    name.push(".part");
    path.with_file_name(name)
}
