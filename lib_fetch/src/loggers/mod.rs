//! # Loggers
//!
//! Console + file logger setup for binaries built on the dispatcher. The
//! library itself only emits `log` records; installing a backend is up to the
//! binary.
pub mod logger_setup;

pub use logger_setup::{cleanup_old_logs, parse_level, setup_logging};
