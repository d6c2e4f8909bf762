//! # Cache Module
//!
//! The filesystem side of the dispatcher: reading cache files (with "not
//! found" kept distinct from other I/O errors), writing them so a failed write
//! never leaves a file behind that could validate, quiet deletion, and ready
//! made cache validators.

/// Async cache file access.
pub mod cache_file;

pub use cache_file::{read_cache, remove_quietly, sha256_hex, sha256_validator, write_cache, CacheError};
