//! Configuration for the vidrelay host.
//!
//! Configuration lives in `~/.vidrelay/config.yaml`. Every field has a default,
//! so a missing file or a partial file is valid. The timeouts here drive the
//! worker supervision layer:
//!
//! - `timeouts.connection_timeout_secs` bounds calls until the worker is set up
//! - `timeouts.operation_timeout_ms` bounds every steady-state call
//! - `health.ping_interval_secs` must stay above the operation timeout so at
//!   most one ping is ever outstanding

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::types::ConfigurationSnapshot;

/// Environment variable the host uses to tell the worker where crash logs go.
pub const TEMP_ROOT_ENV: &str = "VIDRELAY_TEMP_ROOT";

/// Environment variable naming the crash log folder under the temp root.
pub const WORKER_LOG_FOLDER_ENV: &str = "VIDRELAY_WORKER_LOG_FOLDER";

/// Environment variable carrying the worker's log batching interval in ms.
pub const LOG_FLUSH_ENV: &str = "VIDRELAY_LOG_FLUSH_MS";

/// Default crash log folder name.
pub const DEFAULT_WORKER_LOG_FOLDER: &str = "vidrelay-worker-logs";

/// Config file path (typically ~/.vidrelay/config.yaml).
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vidrelay").join("config.yaml"))
}

/// Top-level vidrelay configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Worker process settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Call timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Health checking
    #[serde(default)]
    pub health: HealthConfig,

    /// Worker log batching and crash log location
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Settings passed to the engine at worker setup
    #[serde(default)]
    pub engine: ConfigurationSnapshot,
}

impl RelayConfig {
    /// Load configuration from the default path, falling back to defaults
    /// when no file exists.
    pub fn load() -> Result<Self> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RelayError::ConfigNotFound {
            path: path.to_path_buf(),
            source: Some(e),
        })?;

        let config = Self::parse(&content).map_err(|message| RelayError::ConfigInvalid {
            path: path.to_path_buf(),
            message,
        })?;
        config.validate()?;

        debug!(path = %path.display(), "Loaded vidrelay config");
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str::<RelayConfig>(content).map_err(|e| e.to_string())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(RelayError::ConfigValidation { message });

        if self.health.ping_interval_secs == 0 {
            return fail("health.ping_interval_secs must be > 0".into());
        }

        if self.operation_timeout() >= self.ping_interval() {
            return fail(format!(
                "health.ping_interval_secs ({}) must be greater than the call timeout ({}s)",
                self.health.ping_interval_secs,
                self.operation_timeout().as_secs_f64()
            ));
        }

        if self.health.unresponsive_window_secs < self.health.ping_interval_secs {
            return fail(format!(
                "health.unresponsive_window_secs ({}) must be >= ping_interval_secs ({})",
                self.health.unresponsive_window_secs, self.health.ping_interval_secs
            ));
        }

        if self.worker.connect_retries == 0 {
            return fail("worker.connect_retries must be >= 1".into());
        }

        if self.logging.flush_interval_ms == 0 {
            return fail("logging.flush_interval_ms must be > 0".into());
        }

        let throttling = self.engine.cpu_throttling;
        if !(throttling > 0.0 && throttling <= 1.0) {
            return fail(format!(
                "engine.cpu_throttling must be in (0, 1], got {}",
                throttling
            ));
        }

        Ok(())
    }

    /// Timeout for calls made before the worker is set up.
    pub fn connection_timeout(&self) -> Duration {
        if self.timeouts.debug_mode {
            Duration::from_secs(self.timeouts.debug_timeout_secs)
        } else {
            Duration::from_secs(self.timeouts.connection_timeout_secs)
        }
    }

    /// Timeout for steady-state calls (pings, pause, stop...).
    pub fn operation_timeout(&self) -> Duration {
        if self.timeouts.debug_mode {
            Duration::from_secs(self.timeouts.debug_timeout_secs)
        } else {
            Duration::from_millis(self.timeouts.operation_timeout_ms)
        }
    }

    /// Period of the health-check ping.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.health.ping_interval_secs)
    }

    /// Silence after which a failed ping is treated as a crash.
    pub fn unresponsive_window(&self) -> Duration {
        Duration::from_secs(self.health.unresponsive_window_secs)
    }

    /// Folder holding per-process crash logs.
    pub fn crash_log_folder(&self) -> PathBuf {
        self.logging.temp_root().join(&self.logging.worker_log_folder)
    }
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the worker executable
    #[serde(default = "default_worker_executable")]
    pub executable: PathBuf,

    /// Prefix for generated pipe names (`<prefix>.<uuid>`)
    #[serde(default = "default_pipe_prefix")]
    pub pipe_prefix: String,

    /// How long to wait for the worker's ready line
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Pause between connection attempts
    #[serde(default = "default_connect_retry_interval")]
    pub connect_retry_interval_ms: u64,

    /// How long a worker may take to exit on its own after completing
    #[serde(default = "default_exit_grace")]
    pub exit_grace_secs: u64,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub env: Vec<(String, String)>,

    /// Run operations in a separate worker process (false = in-process engine)
    #[serde(default = "default_true")]
    pub process_isolation: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            executable: default_worker_executable(),
            pipe_prefix: default_pipe_prefix(),
            ready_timeout_secs: default_ready_timeout(),
            connect_retries: default_connect_retries(),
            connect_retry_interval_ms: default_connect_retry_interval(),
            exit_grace_secs: default_exit_grace(),
            env: Vec::new(),
            process_isolation: true,
        }
    }
}

fn default_worker_executable() -> PathBuf {
    let name = if cfg!(windows) {
        "vidrelay-worker.exe"
    } else {
        "vidrelay-worker"
    };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .unwrap_or_else(|| PathBuf::from(name))
}

fn default_pipe_prefix() -> String {
    "vidrelay".to_string()
}

fn default_ready_timeout() -> u64 {
    30
}

fn default_connect_retries() -> u32 {
    10
}

fn default_connect_retry_interval() -> u64 {
    100
}

fn default_exit_grace() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Call timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Timeout for calls until setup succeeds (engine init can be slow)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Timeout for steady-state calls
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Timeout for every call when debugging the worker
    #[serde(default = "default_debug_timeout")]
    pub debug_timeout_secs: u64,

    /// Use the debug timeout everywhere
    #[serde(default)]
    pub debug_mode: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            debug_timeout_secs: default_debug_timeout(),
            debug_mode: false,
        }
    }
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    5_000
}

fn default_debug_timeout() -> u64 {
    1_200
}

/// Health checking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between pings
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Seconds of silence after which a failed ping means the worker is gone
    #[serde(default = "default_unresponsive_window")]
    pub unresponsive_window_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            unresponsive_window_secs: default_unresponsive_window(),
        }
    }
}

fn default_ping_interval() -> u64 {
    6
}

fn default_unresponsive_window() -> u64 {
    20
}

/// Worker log batching and crash log location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// How often the worker flushes batched log lines
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Root for the crash log folder (system temp dir when unset)
    #[serde(default)]
    pub temp_root: Option<PathBuf>,

    /// Crash log folder name under the temp root
    #[serde(default = "default_worker_log_folder")]
    pub worker_log_folder: String,

    /// Run workers with verbose logging
    #[serde(default)]
    pub verbose: bool,

    /// Directory for log files (defaults to ~/.vidrelay/logs/)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            temp_root: None,
            worker_log_folder: default_worker_log_folder(),
            verbose: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Resolved temp root.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_flush_interval() -> u64 {
    100
}

fn default_worker_log_folder() -> String {
    DEFAULT_WORKER_LOG_FOLDER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.ping_interval(), Duration::from_secs(6));
        assert_eq!(config.unresponsive_window(), Duration::from_secs(20));
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.logging.flush_interval(), Duration::from_millis(100));
        assert!(config.worker.process_isolation);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
worker:
  connect_retries: 3
health:
  ping_interval_secs: 8
engine:
  cpu_throttling: 0.5
"#;
        let config = RelayConfig::parse(yaml).unwrap();
        assert_eq!(config.worker.connect_retries, 3);
        assert_eq!(config.worker.pipe_prefix, "vidrelay");
        assert_eq!(config.health.ping_interval_secs, 8);
        assert_eq!(config.health.unresponsive_window_secs, 20);
        assert_eq!(config.engine.cpu_throttling, 0.5);
        assert_eq!(config.engine.preview_count, 10);
    }

    #[test]
    fn test_parse_empty_is_default() {
        assert_eq!(RelayConfig::parse("").unwrap(), RelayConfig::default());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(RelayConfig::parse("worker: [not, a, map").is_err());
    }

    #[test]
    fn test_validate_ping_must_exceed_call_timeout() {
        let mut config = RelayConfig::default();
        config.timeouts.operation_timeout_ms = 6_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_interval_secs"));
    }

    #[test]
    fn test_validate_cpu_throttling_range() {
        let mut config = RelayConfig::default();
        config.engine.cpu_throttling = 0.0;
        assert!(config.validate().is_err());
        config.engine.cpu_throttling = 1.5;
        assert!(config.validate().is_err());
        config.engine.cpu_throttling = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_retries() {
        let mut config = RelayConfig::default();
        config.worker.connect_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_mode_uses_long_timeout() {
        let mut config = RelayConfig::default();
        config.timeouts.debug_mode = true;
        config.health.ping_interval_secs = 2_000;
        config.health.unresponsive_window_secs = 4_000;
        assert_eq!(config.operation_timeout(), Duration::from_secs(1_200));
        assert_eq!(config.connection_timeout(), Duration::from_secs(1_200));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "logging:\n  worker_log_folder: crash-logs\n").unwrap();

        let config = RelayConfig::load_from(&path).unwrap();
        assert_eq!(config.logging.worker_log_folder, "crash-logs");
        assert!(config.crash_log_folder().ends_with("crash-logs"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = RelayConfig::load_from(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_load_from_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "health:\n  ping_interval_secs: 1\n").unwrap();
        let err = RelayConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, RelayError::ConfigValidation { .. }));
    }
}
