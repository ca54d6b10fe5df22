//! Worker process lifecycle using tokio::process.
//!
//! This module provides [`WorkerLifecycle`] for spawning a worker, connecting
//! to its pipe, and tearing it down again. Each spawned process is owned by a
//! supervising task that reaps it and publishes its exit status; the returned
//! [`WorkerHandle`] observes that status and can request a kill.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use vidrelay_core::{RelayError, Result};

use crate::channel::{ChannelEvent, DuplexChannel};
use crate::crash_log::CrashLogStore;
use crate::protocol::READY_LINE;
use crate::transport::{self, PipeEndpoint};
use crate::types::{LaunchConfig, WorkerExit, WorkerHandle};

/// How long to wait for a killed process to be reaped.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Spawns, connects to and tears down worker processes.
#[derive(Debug, Clone)]
pub struct WorkerLifecycle {
    config: LaunchConfig,
    crash_logs: CrashLogStore,
}

impl WorkerLifecycle {
    pub fn new(config: LaunchConfig) -> Self {
        let crash_logs = config.crash_logs();
        Self { config, crash_logs }
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn crash_logs(&self) -> &CrashLogStore {
        &self.crash_logs
    }

    /// Launch a worker and wait for its ready line.
    ///
    /// This will:
    /// 1. Validate the executable exists
    /// 2. Start it with `<parent_pid> <pipe_name>`
    /// 3. Block until it prints the ready line on stdout
    ///
    /// If the worker exits (or stays silent past the ready timeout) first,
    /// the error carries whatever its crash log captured.
    #[instrument(level = "info", skip(self), fields(executable = %self.config.executable.display()))]
    pub async fn spawn(&self) -> Result<WorkerHandle> {
        self.validate_executable(&self.config.executable).await?;

        let pipe_name = self.config.new_pipe_name();
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg(self.config.parent_pid.to_string())
            .arg(&pipe_name)
            .args(self.config.worker_args())
            .envs(self.config.worker_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::spawn_failure(
                format!("failed to launch {}: {e}", self.config.executable.display()),
                None,
            )
        })?;

        let pid = child
            .id()
            .ok_or_else(|| RelayError::spawn_failure("worker exited immediately", None))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::internal("worker stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        let mut lines = BufReader::new(stdout).lines();
        let ready = timeout(self.config.ready_timeout, async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim() == READY_LINE => return true,
                    Ok(Some(line)) => debug!(pid, %line, "worker output before ready"),
                    Ok(None) | Err(_) => return false,
                }
            }
        })
        .await;

        match ready {
            Ok(true) => {}
            Ok(false) => {
                let exit = reap(&mut child).await;
                return Err(self.spawn_failed(
                    pid,
                    &pipe_name,
                    format!(
                        "worker exited before signalling ready (code {})",
                        exit.and_then(|e| e.code)
                            .map_or_else(|| "unknown".to_string(), |c| c.to_string())
                    ),
                ));
            }
            Err(_) => {
                let _ = child.start_kill();
                reap(&mut child).await;
                return Err(self.spawn_failed(
                    pid,
                    &pipe_name,
                    format!(
                        "worker did not signal ready within {}s",
                        self.config.ready_timeout.as_secs_f64()
                    ),
                ));
            }
        }

        tokio::spawn(forward_output(lines.into_inner(), pid, "stdout"));

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        tokio::spawn(supervise(child, pid, exit_tx, kill.clone()));

        info!(pid, %pipe_name, "worker ready");
        Ok(WorkerHandle::new(pid, pipe_name, exit_rx, kill))
    }

    /// Open the duplex channel to a ready worker.
    ///
    /// Retries a fixed number of times at a fixed interval. Each attempt first
    /// checks whether the process has already exited, in which case retrying
    /// is pointless and the crash log is attached to the failure.
    #[instrument(level = "info", skip(self, handle), fields(pid = handle.pid, pipe_name = %handle.pipe_name))]
    pub async fn connect(
        &self,
        handle: &WorkerHandle,
        connection_timeout: Duration,
    ) -> Result<(DuplexChannel, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let endpoint = handle.endpoint();
        let retries = self.config.connect_retries.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=retries {
            if let Some(exit) = handle.exit() {
                return Err(RelayError::ConnectFailure {
                    pipe_name: handle.pipe_name.clone(),
                    attempts: attempt - 1,
                    message: format!("worker exited with code {:?}", exit.code),
                    crash_log: self.take_crash_log(handle.pid),
                });
            }

            match transport::connect(&endpoint).await {
                Ok(io) => {
                    debug!(attempt, address = %endpoint.address(), "connected to worker");
                    handle.touch();
                    return Ok(DuplexChannel::open(
                        io,
                        handle.pipe_name.clone(),
                        connection_timeout,
                    ));
                }
                Err(e) => {
                    debug!(attempt, error = %e, "connection attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < retries {
                tokio::time::sleep(self.config.connect_retry_interval).await;
            }
        }

        Err(RelayError::ConnectFailure {
            pipe_name: handle.pipe_name.clone(),
            attempts: retries,
            message: last_error,
            crash_log: self.crash_logs.read(handle.pid),
        })
    }

    /// Stop the worker process and remove its endpoint. Idempotent.
    ///
    /// With `force_kill` a live process is killed immediately. Otherwise it is
    /// given the exit grace period to leave on its own first.
    #[instrument(level = "debug", skip(self, handle), fields(pid = handle.pid))]
    pub async fn teardown(&self, handle: &WorkerHandle, force_kill: bool) {
        if !handle.mark_torn_down() {
            return;
        }
        if handle.has_exited() {
            debug!("worker already exited");
        } else {
            self.stop_process(handle, force_kill).await;
        }
        transport::remove_endpoint(&handle.endpoint());
    }

    async fn stop_process(&self, handle: &WorkerHandle, force_kill: bool) {
        if !force_kill {
            if handle.wait_for_exit(self.config.exit_grace).await.is_some() {
                debug!("worker exited on its own");
                return;
            }
            warn!(
                grace_secs = self.config.exit_grace.as_secs_f64(),
                "worker did not exit within grace period, killing"
            );
        }

        handle.kill();
        if handle.wait_for_exit(KILL_WAIT).await.is_none() {
            warn!("worker still running after kill");
        }
    }

    async fn validate_executable(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(RelayError::spawn_failure(
                format!("worker executable not found: {}", path.display()),
                None,
            ));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = tokio::fs::metadata(path)
                .await
                .map_err(|e| RelayError::io("checking worker permissions", path, e))?;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(RelayError::spawn_failure(
                    format!("worker executable is not executable: {}", path.display()),
                    None,
                ));
            }
        }

        Ok(())
    }

    fn spawn_failed(&self, pid: u32, pipe_name: &str, message: String) -> RelayError {
        warn!(pid, %message, "worker failed to start");
        transport::remove_endpoint(&PipeEndpoint::new(pipe_name));
        RelayError::spawn_failure(message, self.take_crash_log(pid))
    }

    fn take_crash_log(&self, pid: u32) -> Option<String> {
        let log = self.crash_logs.read(pid);
        self.crash_logs.remove(pid);
        log
    }
}

/// Own the child until it exits, killing it on request.
async fn supervise(
    mut child: Child,
    pid: u32,
    exit_tx: watch::Sender<Option<WorkerExit>>,
    kill: Arc<Notify>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.notified() => {
            debug!(pid, "killing worker");
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => WorkerExit::from_status(status),
        Err(e) => {
            warn!(pid, error = %e, "failed to wait for worker");
            WorkerExit {
                code: None,
                signal: None,
            }
        }
    };
    debug!(pid, code = ?exit.code, signal = ?exit.signal, "worker exited");
    exit_tx.send_replace(Some(exit));
}

async fn reap(child: &mut Child) -> Option<WorkerExit> {
    match timeout(KILL_WAIT, child.wait()).await {
        Ok(Ok(status)) => Some(WorkerExit::from_status(status)),
        _ => {
            let _ = child.start_kill();
            None
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, pid: u32, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "vidrelay::worker", pid, stream = name, "{}", line);
    }
}
