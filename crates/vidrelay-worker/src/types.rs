//! Worker types and data structures.
//!
//! This module defines the handle to a spawned worker process and the
//! configuration used to launch one.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use vidrelay_core::RelayConfig;
use vidrelay_core::config::{LOG_FLUSH_ENV, TEMP_ROOT_ENV, WORKER_LOG_FOLDER_ENV};

use crate::crash_log::CrashLogStore;
use crate::transport::PipeEndpoint;

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal on Unix
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to one running worker process.
///
/// Owned by exactly one operation. The process itself is owned by a
/// supervising task; the handle observes its exit and can ask it to kill.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Process ID of the worker
    pub pid: u32,
    /// Unique pipe name, `<prefix>.<uuid>`
    pub pipe_name: String,
    /// When the worker was started
    pub started_at: DateTime<Utc>,
    exit: watch::Receiver<Option<WorkerExit>>,
    kill: Arc<Notify>,
    epoch: Instant,
    last_communication_ms: AtomicU64,
    torn_down: AtomicBool,
}

impl WorkerHandle {
    /// Create a handle from the supervising task's exit watch and kill signal.
    pub fn new(
        pid: u32,
        pipe_name: impl Into<String>,
        exit: watch::Receiver<Option<WorkerExit>>,
        kill: Arc<Notify>,
    ) -> Self {
        Self {
            pid,
            pipe_name: pipe_name.into(),
            started_at: Utc::now(),
            exit,
            kill,
            epoch: Instant::now(),
            last_communication_ms: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Endpoint this worker listens on.
    pub fn endpoint(&self) -> PipeEndpoint {
        PipeEndpoint::new(&self.pipe_name)
    }

    /// Exit status, if the process has exited.
    pub fn exit(&self) -> Option<WorkerExit> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit().is_some()
    }

    /// Wait up to `limit` for the process to exit.
    pub async fn wait_for_exit(&self, limit: Duration) -> Option<WorkerExit> {
        let mut rx = self.exit.clone();
        let outcome = tokio::time::timeout(limit, rx.wait_for(|exit| exit.is_some())).await;
        match outcome {
            Ok(Ok(exit)) => *exit,
            _ => self.exit(),
        }
    }

    /// Ask the supervising task to kill the process.
    pub fn kill(&self) {
        self.kill.notify_one();
    }

    /// Record a successful exchange with the worker.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_communication_ms.store(elapsed, Ordering::Release);
    }

    /// Time since the last successful exchange (or since spawn).
    pub fn since_last_communication(&self) -> Duration {
        let last = Duration::from_millis(self.last_communication_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Mark the handle torn down. Returns true only for the first caller.
    pub(crate) fn mark_torn_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }
}

/// Configuration for launching a worker.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the worker executable
    pub executable: PathBuf,
    /// Prefix for the generated pipe name
    pub pipe_prefix: String,
    /// Process ID passed to the worker as its parent
    pub parent_pid: u32,
    /// Environment variables to set
    pub env: Vec<(String, String)>,
    /// How long to wait for the ready line
    pub ready_timeout: Duration,
    /// Connection attempts
    pub connect_retries: u32,
    /// Pause between connection attempts
    pub connect_retry_interval: Duration,
    /// How long a graceful teardown waits before killing
    pub exit_grace: Duration,
    /// Root of the crash log folder
    pub temp_root: PathBuf,
    /// Crash log folder name
    pub worker_log_folder: String,
    /// Worker log batching interval
    pub flush_interval: Duration,
    /// Pass `-v` to the worker
    pub verbose: bool,
    /// Pass `--log-dir` to the worker
    pub log_dir: Option<PathBuf>,
}

impl LaunchConfig {
    /// Create a launch configuration with defaults for everything but the executable.
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        let defaults = RelayConfig::default();
        Self {
            executable: executable.into(),
            ..Self::from_config(&defaults)
        }
    }

    /// Build from the host configuration.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            executable: config.worker.executable.clone(),
            pipe_prefix: config.worker.pipe_prefix.clone(),
            parent_pid: std::process::id(),
            env: config.worker.env.clone(),
            ready_timeout: Duration::from_secs(config.worker.ready_timeout_secs),
            connect_retries: config.worker.connect_retries,
            connect_retry_interval: Duration::from_millis(config.worker.connect_retry_interval_ms),
            exit_grace: Duration::from_secs(config.worker.exit_grace_secs),
            temp_root: config.logging.temp_root(),
            worker_log_folder: config.logging.worker_log_folder.clone(),
            flush_interval: config.logging.flush_interval(),
            verbose: config.logging.verbose,
            log_dir: config.logging.log_dir.clone(),
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the ready timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the connection retry budget.
    pub fn with_connect_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.connect_retries = retries;
        self.connect_retry_interval = interval;
        self
    }

    /// Set the graceful exit window.
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    /// Put crash logs under a different root.
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    /// Set the worker's own logging options.
    pub fn with_worker_logging(mut self, log_dir: Option<PathBuf>, verbose: bool) -> Self {
        self.log_dir = log_dir;
        self.verbose = verbose;
        self
    }

    /// Options appended after `<parent_pid> <pipe_name>`.
    pub fn worker_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if self.verbose {
            args.push(OsString::from("-v"));
        }
        if let Some(dir) = &self.log_dir {
            args.push(OsString::from("--log-dir"));
            args.push(dir.clone().into_os_string());
        }
        args
    }

    /// Crash log store the worker will write to.
    pub fn crash_logs(&self) -> CrashLogStore {
        CrashLogStore::new(self.temp_root.join(&self.worker_log_folder))
    }

    /// Environment passed to the worker, crash log location first.
    pub fn worker_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                TEMP_ROOT_ENV.to_string(),
                self.temp_root.to_string_lossy().into_owned(),
            ),
            (
                WORKER_LOG_FOLDER_ENV.to_string(),
                self.worker_log_folder.clone(),
            ),
            (
                LOG_FLUSH_ENV.to_string(),
                self.flush_interval.as_millis().to_string(),
            ),
        ];
        env.extend(self.env.iter().cloned());
        env
    }

    /// Generate a fresh pipe name.
    pub fn new_pipe_name(&self) -> String {
        format!("{}.{}", self.pipe_prefix, uuid::Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (WorkerHandle, watch::Sender<Option<WorkerExit>>, Arc<Notify>) {
        let (tx, rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        (WorkerHandle::new(4242, "vidrelay.test", rx, kill.clone()), tx, kill)
    }

    #[test]
    fn test_worker_handle_creation() {
        let (handle, _tx, _kill) = handle();
        assert_eq!(handle.pid, 4242);
        assert_eq!(handle.pipe_name, "vidrelay.test");
        assert!(!handle.has_exited());
        assert!(!handle.is_torn_down());
    }

    #[tokio::test]
    async fn test_exit_is_observed() {
        let (handle, tx, _kill) = handle();
        tx.send_replace(Some(WorkerExit {
            code: Some(3),
            signal: None,
        }));
        assert!(handle.has_exited());
        let exit = handle.wait_for_exit(Duration::from_millis(10)).await.unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_exit_is_bounded() {
        let (handle, _tx, _kill) = handle();
        assert!(handle.wait_for_exit(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_communication_tracking() {
        let (handle, _tx, _kill) = handle();
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(handle.since_last_communication() >= Duration::from_secs(7));

        handle.touch();
        assert!(handle.since_last_communication() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_kill_signals_supervisor() {
        let (handle, _tx, kill) = handle();
        handle.kill();
        tokio::time::timeout(Duration::from_secs(1), kill.notified())
            .await
            .unwrap();
    }

    #[test]
    fn test_torn_down_once() {
        let (handle, _tx, _kill) = handle();
        assert!(handle.mark_torn_down());
        assert!(!handle.mark_torn_down());
        assert!(handle.is_torn_down());
    }

    #[test]
    fn test_launch_config_builder() {
        let config = LaunchConfig::new("/usr/bin/vidrelay-worker")
            .with_env("VIDRELAY_SIMULATE", "slow")
            .with_ready_timeout(Duration::from_secs(2))
            .with_connect_retries(3, Duration::from_millis(10))
            .with_temp_root("/tmp/vr-test");

        assert_eq!(config.connect_retries, 3);
        assert_eq!(config.ready_timeout, Duration::from_secs(2));
        assert_eq!(
            config.crash_logs().folder(),
            PathBuf::from("/tmp/vr-test/vidrelay-worker-logs").as_path()
        );

        let env = config.worker_env();
        assert_eq!(env[0].0, TEMP_ROOT_ENV);
        assert_eq!(env[0].1, "/tmp/vr-test");
        assert_eq!(env[1].0, WORKER_LOG_FOLDER_ENV);
        assert_eq!(env[2], (LOG_FLUSH_ENV.to_string(), "100".to_string()));
        assert_eq!(env.last().unwrap().0, "VIDRELAY_SIMULATE");
    }

    #[test]
    fn test_worker_logging_args() {
        let quiet = LaunchConfig::new("worker");
        assert!(quiet.worker_args().is_empty());

        let loud = quiet.with_worker_logging(Some(PathBuf::from("/var/log/vidrelay")), true);
        assert_eq!(
            loud.worker_args(),
            vec![
                OsString::from("-v"),
                OsString::from("--log-dir"),
                OsString::from("/var/log/vidrelay")
            ]
        );

        let mut relay = RelayConfig::default();
        relay.logging.verbose = true;
        assert_eq!(LaunchConfig::from_config(&relay).worker_args(), vec![OsString::from("-v")]);
    }

    #[test]
    fn test_pipe_names_are_unique() {
        let config = LaunchConfig::new("worker");
        let a = config.new_pipe_name();
        let b = config.new_pipe_name();
        assert!(a.starts_with("vidrelay."));
        assert_ne!(a, b);
    }
}
