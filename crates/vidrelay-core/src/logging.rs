//! Logging infrastructure for vidrelay.
//!
//! The host and the worker process keep separate log files so a crashed
//! worker's trace can be read next to the host's view of the same failure.
//!
//! ## Features
//!
//! - JSON lines format for machine parsing
//! - Host log at `~/.vidrelay/logs/vidrelay.log`
//! - Worker log at `~/.vidrelay/logs/vidrelay-worker.log`
//! - Console output on stderr only. The worker's stdout carries its ready
//!   line and must never receive log output.
//!
//! ## Example
//!
//! ```no_run
//! use vidrelay_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//!
//! tracing::info!("vidrelay started");
//! tracing::debug!(pid = 4242, "spawning worker");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{RelayError, Result};

/// Host log file name.
pub const HOST_LOG_FILE: &str = "vidrelay.log";

/// Worker log file name.
pub const WORKER_LOG_FILE: &str = "vidrelay-worker.log";

/// Guard that must be held to ensure log flushing on shutdown.
///
/// Keep this guard alive for the lifetime of the application.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize logging for the host process.
///
/// Sets up a daily-rolled JSON file log plus a compact stderr layer.
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.vidrelay/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    init_with_file(log_dir, HOST_LOG_FILE, verbose, true)
}

/// Initialize logging for the worker process.
///
/// The file layer is the primary record. The stderr layer is plain text so the
/// host can forward it into its own trace.
pub fn init_worker_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    init_with_file(log_dir, WORKER_LOG_FILE, verbose, false)
}

fn init_with_file(
    log_dir: Option<PathBuf>,
    file_name: &str,
    verbose: bool,
    ansi: bool,
) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir)
        .map_err(|e| RelayError::io("creating log directory", &log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "vidrelay={default_level},vidrelay_core={default_level},vidrelay_worker={default_level}"
        ))
    });

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| RelayError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), file_name, verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for testing.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the default log directory path.
///
/// Returns `~/.vidrelay/logs/`
pub fn default_log_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| RelayError::internal("home directory not found"))?;
    Ok(home.join(".vidrelay").join("logs"))
}
