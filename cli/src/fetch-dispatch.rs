//! # `fetch-dispatch`: Run a Manifest of Cached HTTP Fetches
//!
//! Loads a JSON manifest of requests, registers them with a `lib_fetch`
//! dispatcher and runs one dispatch cycle. Each request accepts any non-empty
//! body; accepted bodies are written through to their cache files, and failed
//! live fetches fall back to the cache when the manifest entry asks for it.
//!
//! ## Usage
//!
//! ```bash
//! fetch-dispatch --manifest requests.json [OPTIONS]
//!
//! # Example: refresh caches under ./cache with 8 workers
//! fetch-dispatch -m requests.json --cache-dir ./cache -w 8
//!
//! # Example: serve everything from the cache, no network
//! fetch-dispatch -m requests.json --cache-only
//! ```
//!
//! Settings are layered as defaults, then `--config` (JSON), then `FETCH_*`
//! environment variables (a `.env` file is loaded first), then the flags below.
//! The process exits with status 1 when any request could not be satisfied.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;

use lib_fetch::configs::{load_manifest, PartialDispatcherConfig};
use lib_fetch::loggers::setup_logging;
use lib_fetch::{CycleReport, Dispatcher, DispatcherConfig};

/// # Command Line Arguments
#[derive(Parser, Debug)]
#[command(
    name = "fetch-dispatch",
    version,
    about = "Dispatches a JSON manifest of HTTP requests with cache fallback"
)]
struct Args {
    /// JSON manifest listing the requests to dispatch.
    #[arg(short, long, env = "FETCH_MANIFEST")]
    manifest: PathBuf,

    /// Optional JSON dispatcher config (camelCase keys). A missing file is ignored.
    #[arg(short, long, env = "FETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Base directory for relative cache files (overrides FETCH_CACHE_DIR).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Never fetch; satisfy requests from their cache backups only (overrides FETCH_CACHE_ONLY).
    #[arg(long)]
    cache_only: bool,

    /// Number of concurrent workers (overrides FETCH_WORKERS).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Default per-request timeout in milliseconds, 0 for none (overrides FETCH_DEFAULT_TIMEOUT_MS).
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Directory for log files.
    #[arg(long, env = "FETCH_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Log level: trace, debug, info, warn, error or off.
    #[arg(long, env = "FETCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    /// The configuration layer set by flags.
    fn overrides(&self) -> PartialDispatcherConfig {
        PartialDispatcherConfig {
            worker_count: self.workers,
            cache_only: self.cache_only.then_some(true),
            default_timeout_ms: self.timeout_ms,
            cache_dir: self.cache_dir.clone(),
            ..Default::default()
        }
    }
}

/// Loads `.env`, then the platform specific `.env.linux` / `.env.windows`.
fn load_dotenv() {
    let dotenv_os = if cfg!(target_os = "windows") {
        ".env.windows"
    } else {
        ".env.linux"
    };
    dotenvy::dotenv().ok();
    dotenvy::from_filename(dotenv_os).ok();
}

/// # Main Entry Point
///
/// ## Workflow:
/// 1.  Load `.env` files and parse the arguments.
/// 2.  Install the console + file logger.
/// 3.  Resolve the dispatcher configuration and read the manifest.
/// 4.  Register one request per manifest entry.
/// 5.  Run the cycle (Ctrl-C interrupts it) and print a summary.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    // 1. Environment and arguments
    load_dotenv();
    let args = Args::parse();

    // 2. Logging
    setup_logging(&args.log_dir, &args.log_level, "fetch-dispatch")
        .context("Failed to initialize logging")?;

    // 3. Configuration and manifest
    let config = DispatcherConfig::load(args.config.as_deref())
        .context("Failed to load dispatcher configuration")?
        .with_overrides(args.overrides());
    let specs = load_manifest(&args.manifest)
        .with_context(|| format!("Failed to load manifest {}", args.manifest.display()))?;
    log::info!(
        "Loaded {} request(s) from {}",
        specs.len(),
        args.manifest.display()
    );

    let dispatcher = Dispatcher::with_reqwest(config).context("Failed to create HTTP client")?;

    // 4. Registration
    for spec in &specs {
        let id = spec.id.clone();
        let request = spec
            .builder()
            .handle(|_, bytes| !bytes.is_empty())
            .on_error(move |e| log::error!("Request {} failed: {}", id, e))
            .build()
            .with_context(|| format!("Invalid manifest entry '{}'", spec.id))?;
        if !dispatcher.add_request(request) {
            log::warn!("Duplicate request id '{}' in manifest, skipping", spec.id);
        }
    }

    // 5. Dispatch
    let interrupter = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupter.interrupt();
        }
    });

    let Some(report) = dispatcher.dispatch().await else {
        println!("{}", "Nothing to dispatch.".yellow());
        return Ok(ExitCode::SUCCESS);
    };
    print_summary(&report);

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn print_summary(report: &CycleReport) {
    println!("Cycle {}:", report.cycle);
    for id in &report.from_live {
        println!("  {} {}", "fetched ".green(), id);
    }
    for id in &report.from_cache {
        println!("  {} {}", "cached  ".green(), id);
    }
    for id in &report.from_backup {
        println!("  {} {}", "backup  ".yellow(), id);
    }
    for id in &report.failed {
        println!("  {} {}", "failed  ".red(), id);
    }
    for id in &report.rearmed {
        println!("  {} {}", "skipped ".truecolor(128, 128, 128), id);
    }

    let totals = format!(
        "{} satisfied, {} failed{}",
        report.satisfied(),
        report.failed.len(),
        if report.interrupted { ", interrupted" } else { "" }
    );
    if report.is_success() {
        println!("{}", totals.green());
    } else {
        println!("{}", totals.red());
    }
}
