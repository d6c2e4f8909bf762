//! # Logger Setup
//!
//! The library itself only talks to the `log` facade. Binaries call
//! [`setup_logging`] once at startup to route those records to stdout and to a
//! timestamped log file.

use anyhow::Result;
use std::fs;
use std::path::Path;

/// Installs a global `fern` logger writing to stdout and to
/// `<log_dir>/<app_name>_<timestamp>.log`.
///
/// Older log files of the same application are pruned first, keeping only the
/// most recent one.
///
/// # Errors
/// Fails if the directory or log file cannot be created, or if a global
/// logger is already installed.
pub fn setup_logging(log_dir: &Path, log_level: &str, app_name: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Clean up old log files, keeping only the most recent one
    cleanup_old_logs(log_dir, app_name)?;

    let log_file_name = format!(
        "{}_{}.log",
        app_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}

/// Maps a level name to a filter. Unknown names fall back to `Info`.
pub fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Deletes all but the newest `<app_name>_*.log` file in `log_dir`.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str) -> Result<()> {
    let prefix = format!("{}_", app_name);
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Sort by modification time, newest first
    entries.sort_by_key(|(modified, _)| std::cmp::Reverse(*modified));

    // Keep the most recent one (index 0), delete the rest
    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn parse_level_defaults_to_info() {
        assert_eq!(parse_level("DEBUG"), log::LevelFilter::Debug);
        assert_eq!(parse_level("warn"), log::LevelFilter::Warn);
        assert_eq!(parse_level("verbose"), log::LevelFilter::Info);
    }

    #[test]
    fn cleanup_keeps_newest_log_of_the_app_only() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("fetch_2024-01-01.log");
        let newer = dir.path().join("fetch_2024-01-02.log");
        let other_app = dir.path().join("other_2023-01-01.log");
        let not_a_log = dir.path().join("fetch_notes.txt");
        for path in [&older, &newer, &other_app, &not_a_log] {
            fs::write(path, "x").unwrap();
        }
        let past = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&older)
            .unwrap()
            .set_modified(past)
            .unwrap();

        cleanup_old_logs(dir.path(), "fetch").unwrap();

        assert!(!older.exists());
        assert!(newer.exists());
        assert!(other_app.exists());
        assert!(not_a_log.exists());
    }
}
