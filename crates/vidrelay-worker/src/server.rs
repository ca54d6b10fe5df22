//! Worker side of the duplex pipe.
//!
//! [`WorkerServer::run`] is the body of the `vidrelay-worker` process:
//!
//! ```text
//!  bind endpoint ──▶ print "ready" ──▶ accept host ──▶ serve calls
//!                                                        │
//!        engine events ──▶ LogAggregator / crash log ───▶ notifications
//! ```
//!
//! The server exits when the host disconnects, when the operation has
//! completed and the host has had time to hang up, or when the parent
//! process disappears.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use vidrelay_core::config::LOG_FLUSH_ENV;
use vidrelay_core::{CompletionResult, EncodeRequest, RelayError, Result};

use crate::crash_log::CrashLogStore;
use crate::engine::{Engine, EngineEvent};
use crate::log_aggregator::{DEFAULT_FLUSH_INTERVAL, LogAggregator};
use crate::protocol::{
    Notification, PING_REPLY, READY_LINE, Reply, Request, WorkerCall, WorkerFrame, decode_frame,
    encode_frame,
};
use crate::transport::{PipeEndpoint, PipeListener};

/// How often the worker checks that its parent is alive.
pub const PARENT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long the worker lingers after completing for the host to disconnect.
pub const COMPLETION_LINGER: Duration = Duration::from_secs(10);

/// Serves one host connection on behalf of an engine.
pub struct WorkerServer {
    engine: Arc<dyn Engine>,
    crash_logs: CrashLogStore,
    flush_interval: Duration,
    pid: u32,
}

impl WorkerServer {
    pub fn new(engine: Arc<dyn Engine>, crash_logs: CrashLogStore) -> Self {
        Self {
            engine,
            crash_logs,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            pid: std::process::id(),
        }
    }

    /// Set the log batching interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Bind `pipe_name`, announce readiness on `ready_out`, and serve the host.
    #[instrument(level = "info", skip(self, ready_out), fields(engine = self.engine.name()))]
    pub async fn run<W>(self, pipe_name: &str, parent_pid: u32, mut ready_out: W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut listener = PipeListener::bind(PipeEndpoint::new(pipe_name))?;
        info!(address = %listener.endpoint().address(), "listening");

        ready_out
            .write_all(format!("{READY_LINE}\n").as_bytes())
            .await
            .map_err(|e| RelayError::io("writing ready line", "stdout", e))?;
        ready_out
            .flush()
            .await
            .map_err(|e| RelayError::io("writing ready line", "stdout", e))?;

        let io = tokio::select! {
            io = listener.accept() => io?,
            _ = wait_for_parent_exit(parent_pid) => {
                warn!(parent_pid, "parent exited before connecting");
                return Ok(());
            }
        };
        info!("host connected");

        let (read_half, mut write_half) = tokio::io::split(io);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WorkerFrame>();

        // Single writer keeps frames whole and ordered.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let bytes = match encode_frame(&frame) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "failed to encode frame");
                        continue;
                    }
                };
                if write_half.write_all(&bytes).await.is_err() || write_half.flush().await.is_err()
                {
                    break;
                }
            }
        });

        let aggregator = LogAggregator::start(self.flush_interval, out_tx.clone());
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<EngineEvent>();
        let mut engine_tx = Some(engine_tx);
        let mut lines = BufReader::new(read_half).lines();
        let mut linger_until: Option<Instant> = None;
        let mut parent_check = tokio::time::interval(PARENT_CHECK_INTERVAL);
        parent_check.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let reply = match decode_frame::<Request>(&line) {
                            Ok(request) => self.handle(request, &mut engine_tx).await,
                            Err(e) => {
                                warn!(error = %e, "malformed request");
                                continue;
                            }
                        };
                        let _ = out_tx.send(WorkerFrame::Reply(reply));
                    }
                    Ok(None) => {
                        info!("host disconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "read from host failed");
                        break;
                    }
                },
                Some(event) = engine_rx.recv() => {
                    let completed = linger_until.is_some();
                    if self.forward(event, &aggregator, &out_tx, completed).await && !completed {
                        linger_until = Some(Instant::now() + COMPLETION_LINGER);
                    }
                }
                _ = sleep_until_opt(linger_until) => {
                    info!("host did not disconnect after completion");
                    break;
                }
                _ = parent_check.tick() => {
                    if !process_alive(parent_pid) {
                        warn!(parent_pid, "parent process is gone, stopping");
                        let _ = self.engine.stop().await;
                        break;
                    }
                }
            }
        }

        aggregator.flush().await;
        drop(aggregator);
        drop(out_tx);
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        Ok(())
    }

    async fn handle(
        &self,
        request: Request,
        engine_tx: &mut Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> Reply {
        let id = request.id;
        let name = request.call.name();
        debug!(id, call = name, "handling call");

        if !matches!(request.call, WorkerCall::SetUpWorker { .. } | WorkerCall::Ping)
            && engine_tx.is_some()
        {
            return Reply::error(id, format!("{name} called before set_up_worker"));
        }

        let outcome = match request.call {
            WorkerCall::Ping => return Reply::value(id, PING_REPLY),
            WorkerCall::SetUpWorker { config } => match engine_tx.take() {
                Some(tx) => self.engine.set_up(&config, tx).await,
                None => Err(RelayError::OperationFailure {
                    message: "worker is already set up".into(),
                }),
            },
            WorkerCall::StartScan { path } => self.engine.start_scan(&path).await,
            WorkerCall::StartEncode { request } => self.engine.start_encode(&request).await,
            WorkerCall::StartEncodeFromPayload { payload } => {
                match serde_json::from_str::<EncodeRequest>(&payload) {
                    Ok(request) => self.engine.start_encode(&request).await,
                    Err(e) => Err(RelayError::json_parse("encode payload", e)),
                }
            }
            WorkerCall::Pause => self.engine.pause().await,
            WorkerCall::Resume => self.engine.resume().await,
            WorkerCall::Stop => self.engine.stop().await,
            WorkerCall::UpdateCpuThrottling { fraction } => {
                if fraction > 0.0 && fraction <= 1.0 {
                    self.engine.set_cpu_throttling(fraction).await
                } else {
                    Err(RelayError::ConfigValidation {
                        message: format!("cpu throttling must be in (0, 1], got {fraction}"),
                    })
                }
            }
        };

        match outcome {
            Ok(()) => Reply::ok(id),
            Err(e) => {
                warn!(call = name, error = %e, "call failed");
                Reply::error(id, e.to_string())
            }
        }
    }

    /// Forward one engine event. Returns true once the operation has
    /// completed.
    async fn forward(
        &self,
        event: EngineEvent,
        aggregator: &LogAggregator,
        out: &mpsc::UnboundedSender<WorkerFrame>,
        completed: bool,
    ) -> bool {
        let notification = match event {
            EngineEvent::Log(text) => {
                aggregator.log_message(text).await;
                return completed;
            }
            EngineEvent::Error(text) => {
                if let Err(e) = self.crash_logs.append(self.pid, &text) {
                    warn!(error = %e, "failed to write crash log");
                }
                aggregator.log_error(text).await;
                return completed;
            }
            EngineEvent::Exception(text) => {
                if let Err(e) = self.crash_logs.append(self.pid, &text) {
                    warn!(error = %e, "failed to write crash log");
                }
                aggregator.log_exception(text.clone()).await;
                if completed {
                    return true;
                }
                error!("engine died without completing");
                let result = CompletionResult::failed(text);
                let _ = out.send(WorkerFrame::Notify(Notification::Completed { result }));
                return true;
            }
            EngineEvent::Started => Notification::Started,
            EngineEvent::Progress(progress) => Notification::Progress { progress },
            EngineEvent::ScanCompleted(scan_json) => Notification::ScanCompleted { scan_json },
            EngineEvent::Completed(result) => {
                aggregator.flush().await;
                info!(code = ?result.code, "operation completed");
                let _ = out.send(WorkerFrame::Notify(Notification::Completed { result }));
                return true;
            }
        };
        // Routine lines queued so far go out ahead of state changes.
        aggregator.flush().await;
        let _ = out.send(WorkerFrame::Notify(notification));
        completed
    }
}

/// Log batching interval passed down by the host, or the default.
pub fn flush_interval_from_env() -> Duration {
    std::env::var(LOG_FLUSH_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map_or(DEFAULT_FLUSH_INTERVAL, Duration::from_millis)
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_parent_exit(parent_pid: u32) {
    let mut ticker = tokio::time::interval(PARENT_CHECK_INTERVAL);
    loop {
        ticker.tick().await;
        if !process_alive(parent_pid) {
            return;
        }
    }
}

/// Whether a process with `pid` exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Record panics in the crash log before the process dies.
pub fn install_panic_hook(crash_logs: CrashLogStore) {
    let pid = std::process::id();
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _ = crash_logs.append(pid, &format!("panic: {info}"));
        previous(info);
    }));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::{ChannelEvent, DuplexChannel};
    use crate::simulated::{SimulatedEngine, Simulation};
    use crate::transport;
    use tempfile::TempDir;
    use vidrelay_core::{ConfigurationSnapshot, EncodeJob, ResultCode};

    struct Harness {
        channel: DuplexChannel,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        server: tokio::task::JoinHandle<Result<()>>,
        crash_logs: CrashLogStore,
        _dir: TempDir,
    }

    async fn harness(simulation: Simulation) -> Harness {
        let dir = TempDir::new().unwrap();
        let crash_logs = CrashLogStore::new(dir.path().join("logs"));
        let pipe_name = format!("vidrelay-test.{}", uuid::Uuid::new_v4());
        let engine = Arc::new(SimulatedEngine::new(simulation).with_step(Duration::from_millis(10)));
        let server = WorkerServer::new(engine, crash_logs.clone())
            .with_flush_interval(Duration::from_millis(20));

        let (ready_tx, ready_rx) = tokio::io::duplex(64);
        let server = {
            let pipe_name = pipe_name.clone();
            tokio::spawn(async move { server.run(&pipe_name, std::process::id(), ready_tx).await })
        };

        let mut ready = BufReader::new(ready_rx).lines();
        assert_eq!(ready.next_line().await.unwrap().as_deref(), Some(READY_LINE));

        let io = transport::connect(&PipeEndpoint::new(&pipe_name)).await.unwrap();
        let (channel, events) = DuplexChannel::open(io, pipe_name, Duration::from_secs(5));
        Harness {
            channel,
            events,
            server,
            crash_logs,
            _dir: dir,
        }
    }

    async fn notifications_until_completed(
        events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Vec<Notification> {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Notification(n) => {
                    let done = n.is_terminal();
                    seen.push(n);
                    if done {
                        break;
                    }
                }
                ChannelEvent::Closed { .. } => break,
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_calls_before_set_up_are_rejected() {
        let h = harness(Simulation::Normal).await;
        h.channel.ping().await.unwrap();
        let err = h.channel.start_scan("/movies/a.mkv").await.unwrap_err();
        assert!(err.to_string().contains("before set_up_worker"));
    }

    #[tokio::test]
    async fn test_scan_session() {
        let mut h = harness(Simulation::Normal).await;
        h.channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        h.channel.start_scan("/movies/a.mkv").await.unwrap();

        let seen = notifications_until_completed(&mut h.events).await;
        assert_eq!(seen.first(), Some(&Notification::MessageLogged {
            text: "Scanning /movies/a.mkv".into()
        }));
        assert!(seen.iter().any(|n| matches!(n, Notification::ScanCompleted { .. })));
        match seen.last() {
            Some(Notification::Completed { result }) => assert!(result.is_success()),
            other => panic!("unexpected last notification {other:?}"),
        }

        h.channel.close().await;
        h.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_set_up_twice_fails() {
        let h = harness(Simulation::Normal).await;
        let config = ConfigurationSnapshot::default();
        h.channel.set_up_worker(&config, Duration::from_secs(5)).await.unwrap();
        assert!(h.channel.set_up_worker(&config, Duration::from_secs(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_encode_from_payload_and_stop() {
        let mut h = harness(Simulation::Slow).await;
        h.channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        let payload =
            serde_json::to_string(&EncodeRequest::new(EncodeJob::new("/in.mkv", "/out.mp4")))
                .unwrap();
        h.channel.start_encode_from_payload(&payload).await.unwrap();
        h.channel.update_cpu_throttling(0.5).await.unwrap();
        assert!(h.channel.update_cpu_throttling(1.5).await.is_err());
        h.channel.stop().await.unwrap();

        let seen = notifications_until_completed(&mut h.events).await;
        match seen.last() {
            Some(Notification::Completed { result }) => {
                assert_eq!(result.code, ResultCode::Cancelled)
            }
            other => panic!("unexpected last notification {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_payload_is_rejected() {
        let h = harness(Simulation::Normal).await;
        h.channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        let err = h.channel.start_encode_from_payload("{not json").await.unwrap_err();
        assert!(matches!(err, RelayError::OperationFailure { .. }));
    }

    #[tokio::test]
    async fn test_engine_errors_reach_crash_log_and_host() {
        let mut h = harness(Simulation::Fail).await;
        h.channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        h.channel.start_scan("/movies/a.mkv").await.unwrap();

        let seen = notifications_until_completed(&mut h.events).await;
        let error_at = seen
            .iter()
            .position(|n| matches!(n, Notification::ErrorLogged { .. }))
            .unwrap();
        let message_at = seen
            .iter()
            .position(|n| matches!(n, Notification::MessageLogged { .. }))
            .unwrap();
        assert!(message_at < error_at);

        let log = h.crash_logs.read(std::process::id()).unwrap();
        assert!(log.contains("No valid title found"));
    }

    #[tokio::test]
    async fn test_engine_panic_is_reported_as_exception() {
        let mut h = harness(Simulation::Panic).await;
        h.channel
            .set_up_worker(&ConfigurationSnapshot::default(), Duration::from_secs(5))
            .await
            .unwrap();
        let request = EncodeRequest::new(EncodeJob::new("/in.mkv", "/out.mp4"));
        h.channel.start_encode(&request).await.unwrap();

        let seen = notifications_until_completed(&mut h.events).await;
        let exception_at = seen
            .iter()
            .position(|n| {
                matches!(n, Notification::Exception { text } if text.contains("decoder state corrupted"))
            })
            .unwrap();
        let routine_at = seen
            .iter()
            .position(|n| matches!(n, Notification::MessageLogged { text } if text.contains("Engine state corrupted")))
            .unwrap();
        assert!(routine_at < exception_at);
        match seen.last() {
            Some(Notification::Completed { result }) => assert_eq!(result.code, ResultCode::Failed),
            other => panic!("unexpected last notification {other:?}"),
        }
        let log = h.crash_logs.read(std::process::id()).unwrap();
        assert!(log.contains("decoder state corrupted"));
    }

    #[test]
    #[serial_test::serial]
    fn test_flush_interval_from_env() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::set_var(LOG_FLUSH_ENV, "250") };
        assert_eq!(flush_interval_from_env(), Duration::from_millis(250));

        unsafe { std::env::set_var(LOG_FLUSH_ENV, "0") };
        assert_eq!(flush_interval_from_env(), DEFAULT_FLUSH_INTERVAL);

        unsafe { std::env::remove_var(LOG_FLUSH_ENV) };
        assert_eq!(flush_interval_from_env(), DEFAULT_FLUSH_INTERVAL);
    }

    #[test]
    fn test_own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
