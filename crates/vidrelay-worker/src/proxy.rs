//! Operation proxy: one scan or encode running in an isolated worker.
//!
//! ```text
//!   start ─▶ spawn ─▶ connect ─▶ set_up ─▶ Scanning ─▶ start request
//!                                             │
//!            ┌────────────── dispatch task ◀──┴── channel events
//!            │                     ▲
//!            ▼                     └─────────── faults (health, calls, drop)
//!      EventRelay ─▶ host
//! ```
//!
//! The dispatch task is the single consumer of everything the worker sends.
//! It ends the operation either on the worker's `completed` notification or
//! by recovering from a fault. Both paths go through
//! [`StateMachine::finish`], so exactly one of them reports.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use vidrelay_core::{
    CompletionResult, LogEntry, LogSource, OperationState, RelayConfig, RelayError, Result,
};

use crate::channel::{ChannelEvent, DuplexChannel};
use crate::crash_log::classify;
use crate::events::{EventRelay, OperationEvent};
use crate::executor::{Operation, OperationExecutor};
use crate::health::{self, HealthMonitorConfig, PingTarget};
use crate::lifecycle::WorkerLifecycle;
use crate::protocol::Notification;
use crate::state::{Control, StateMachine, plan};
use crate::types::{LaunchConfig, WorkerHandle};

/// How long recovery waits for a failing worker to exit before classifying.
const EXIT_SETTLE: Duration = Duration::from_millis(500);

#[derive(Clone)]
struct WorkerSession {
    handle: Arc<WorkerHandle>,
    channel: Arc<DuplexChannel>,
}

struct ProxyInner {
    config: RelayConfig,
    lifecycle: WorkerLifecycle,
    state: StateMachine,
    events: EventRelay,
    session: Mutex<Option<WorkerSession>>,
    /// Serializes state transitions with their `StateChanged` events.
    process_lock: Mutex<()>,
    /// Serializes control commands.
    command_lock: Mutex<()>,
    faults: mpsc::UnboundedSender<RelayError>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<RelayError>>>,
    started: AtomicBool,
    /// Stop asked for while the worker was still launching.
    stop_requested: AtomicBool,
}

/// Runs one operation in a dedicated worker process.
pub struct OperationProxy {
    inner: Arc<ProxyInner>,
}

impl OperationProxy {
    pub fn new(config: RelayConfig) -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let lifecycle = WorkerLifecycle::new(LaunchConfig::from_config(&config));
        Self::with_lifecycle(config, lifecycle)
    }

    /// Use a prepared lifecycle instead of one derived from `config.worker`.
    pub fn with_lifecycle(
        config: RelayConfig,
        lifecycle: WorkerLifecycle,
    ) -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (events, events_rx) = EventRelay::new();
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let inner = ProxyInner {
            config,
            lifecycle,
            state: StateMachine::new(),
            events,
            session: Mutex::new(None),
            process_lock: Mutex::new(()),
            command_lock: Mutex::new(()),
            faults,
            faults_rx: Mutex::new(Some(faults_rx)),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        };
        let proxy = Self {
            inner: Arc::new(inner),
        };
        (proxy, events_rx)
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.inner.state.subscribe()
    }

    /// Process id of the current worker, while one is attached.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.handle.pid)
    }

    async fn control(&self, control: Control) -> Result<()> {
        let inner = &self.inner;
        let _command = inner.command_lock.lock().await;

        let state = inner.state.state();
        if control == Control::Stop
            && state == OperationState::NotStarted
            && inner.started.load(Ordering::Acquire)
        {
            info!("stop requested while the worker is launching, deferring");
            inner.stop_requested.store(true, Ordering::Release);
            return Ok(());
        }
        self.send_control(control).await
    }

    /// Send `control` to the worker. The caller holds the command lock.
    async fn send_control(&self, control: Control) -> Result<()> {
        let inner = &self.inner;
        let state = inner.state.state();
        let Some(next) = plan(control, state)? else {
            debug!(command = control.name(), %state, "command has no effect");
            return Ok(());
        };
        let Some(session) = inner.current_session().await else {
            return Ok(());
        };

        let outcome = match control {
            Control::Pause => session.channel.pause().await,
            Control::Resume => session.channel.resume().await,
            Control::Stop => session.channel.stop().await,
        };

        match outcome {
            Ok(()) => {
                session.handle.touch();
                inner.enter(next).await;
            }
            Err(e) => {
                warn!(command = control.name(), error = %e, "command failed, recovering");
                let _ = inner.faults.send(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OperationExecutor for OperationProxy {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn state(&self) -> OperationState {
        self.inner.state.state()
    }

    #[instrument(level = "info", skip_all, fields(operation = operation.name()))]
    async fn start(&self, operation: Operation) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::OperationInProgress);
        }
        let faults_rx = inner
            .faults_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::internal("fault receiver already taken"))?;

        let (session, channel_events) = match inner.launch().await {
            Ok(launched) => launched,
            Err(e) => {
                error!(error = %e, "worker failed to start");
                inner.end().await;
                inner.events.close().await;
                return Err(e);
            }
        };
        // Controls wait until the start request is out.
        let _command = inner.command_lock.lock().await;
        *inner.session.lock().await = Some(session.clone());

        let pinger = Arc::new(SessionPinger {
            session: session.clone(),
            state: inner.state.subscribe(),
        });
        let monitor = health::spawn(
            pinger,
            HealthMonitorConfig::from_config(&inner.config),
            inner.faults.clone(),
        );

        inner.enter(OperationState::Scanning).await;
        tokio::spawn(dispatch(
            inner.clone(),
            session.clone(),
            channel_events,
            faults_rx,
            monitor,
            operation.is_scan(),
        ));

        let request = match &operation {
            Operation::Scan { path } => session.channel.start_scan(path).await,
            Operation::Encode(request) => session.channel.start_encode(request).await,
            Operation::EncodePayload(payload) => {
                session.channel.start_encode_from_payload(payload).await
            }
        };
        match request {
            Ok(()) => {
                session.handle.touch();
                info!(pid = session.handle.pid, "operation started");
                if inner.stop_requested.swap(false, Ordering::AcqRel) {
                    info!("sending deferred stop");
                    self.send_control(Control::Stop).await?;
                }
            }
            Err(e) => {
                warn!(error = %e, "start request failed, recovering");
                let _ = inner.faults.send(e);
            }
        }
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.control(Control::Pause).await
    }

    async fn resume(&self) -> Result<()> {
        self.control(Control::Resume).await
    }

    async fn stop(&self) -> Result<()> {
        self.control(Control::Stop).await
    }

    async fn stop_and_wait(&self) -> Result<()> {
        let inner = &self.inner;
        self.control(Control::Stop).await?;
        if inner.state.state() == OperationState::NotStarted {
            if !inner.started.load(Ordering::Acquire) {
                return Ok(());
            }
            let launch_limit = inner.launch_limit();
            let mut state = inner.state.subscribe();
            let launched = tokio::time::timeout(
                launch_limit,
                state.wait_for(|s| *s != OperationState::NotStarted),
            )
            .await
            .is_ok();
            if !launched {
                warn!(
                    waited_secs = launch_limit.as_secs_f64(),
                    "worker launch did not finish, giving up on stop"
                );
                return Ok(());
            }
        }

        let limit = inner.config.operation_timeout() + inner.lifecycle.config().exit_grace;
        if tokio::time::timeout(limit, inner.state.wait_finished())
            .await
            .is_ok()
        {
            return Ok(());
        }

        warn!(
            waited_secs = limit.as_secs_f64(),
            "worker did not finish after stop, terminating"
        );
        let _ = inner.faults.send(RelayError::timeout("stop", limit));
        if tokio::time::timeout(limit, inner.state.wait_finished())
            .await
            .is_err()
        {
            // Recovery itself is stuck; make sure the process goes away.
            if let Some(session) = inner.current_session().await {
                session.handle.kill();
            }
            error!("operation did not finish after termination");
        }
        Ok(())
    }

    async fn update_cpu_throttling(&self, fraction: f64) -> Result<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(RelayError::ConfigValidation {
                message: format!("cpu throttling must be in (0, 1], got {fraction}"),
            });
        }
        let inner = &self.inner;
        let state = inner.state.state();
        let session = match inner.current_session().await {
            Some(session) if state.is_active() => session,
            _ => return Err(RelayError::invalid_state("update cpu throttling", state)),
        };
        match session.channel.update_cpu_throttling(fraction).await {
            Ok(()) => {
                session.handle.touch();
                debug!(fraction, "cpu throttling updated");
            }
            Err(e) => {
                warn!(error = %e, "throttling update failed, recovering");
                let _ = inner.faults.send(e);
            }
        }
        Ok(())
    }
}

impl Drop for OperationProxy {
    fn drop(&mut self) {
        if self.inner.state.state().is_active() {
            let _ = self
                .inner
                .faults
                .send(RelayError::internal("operation proxy dropped while active"));
        }
    }
}

impl ProxyInner {
    async fn current_session(&self) -> Option<WorkerSession> {
        self.session.lock().await.clone()
    }

    /// Longest a launch can take: ready line, connect retries and set-up.
    fn launch_limit(&self) -> Duration {
        let launch = self.lifecycle.config();
        launch.ready_timeout
            + launch.connect_retry_interval * launch.connect_retries
            + self.config.connection_timeout()
            + launch.exit_grace
    }

    /// Spawn, connect and configure a worker.
    async fn launch(&self) -> Result<(WorkerSession, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let handle = Arc::new(self.lifecycle.spawn().await?);

        let (channel, channel_events) = match self
            .lifecycle
            .connect(&handle, self.config.connection_timeout())
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                self.lifecycle.teardown(&handle, true).await;
                self.lifecycle.crash_logs().remove(handle.pid);
                return Err(e);
            }
        };
        let channel = Arc::new(channel);

        if let Err(e) = channel
            .set_up_worker(&self.config.engine, self.config.operation_timeout())
            .await
        {
            let error = self.classify(&handle, e).await;
            channel.close().await;
            self.lifecycle.teardown(&handle, true).await;
            self.lifecycle.crash_logs().remove(handle.pid);
            return Err(error);
        }
        handle.touch();

        Ok((WorkerSession { handle, channel }, channel_events))
    }

    /// Explain `fault` using the process exit status and crash log.
    async fn classify(&self, handle: &WorkerHandle, fault: RelayError) -> RelayError {
        let exit = match handle.exit() {
            Some(exit) => Some(exit),
            None => handle.wait_for_exit(EXIT_SETTLE).await,
        };
        let crash_log = self.lifecycle.crash_logs().read(handle.pid);
        classify(handle.pid, exit, crash_log, fault)
    }

    /// Move to `to` and report it. Rejected transitions are dropped.
    async fn enter(&self, to: OperationState) -> bool {
        let _lock = self.process_lock.lock().await;
        match self.state.transition(to) {
            Ok(_) => {
                debug!(state = %to, "state changed");
                self.events.state_changed(to).await;
                true
            }
            Err(e) => {
                debug!(error = %e, "transition skipped");
                false
            }
        }
    }

    /// Enter `Finished`. Returns true only for the path that ended the
    /// operation.
    async fn end(&self) -> bool {
        let _lock = self.process_lock.lock().await;
        if !self.state.finish() {
            return false;
        }
        self.events.state_changed(OperationState::Finished).await;
        true
    }

    /// Handle one notification. Returns true when the operation is over.
    async fn on_notification(
        &self,
        session: &WorkerSession,
        notification: Notification,
        scan_only: bool,
    ) -> bool {
        let pid = session.handle.pid;
        match notification {
            Notification::Started => {
                if !scan_only && self.state.state() == OperationState::Scanning {
                    self.enter(OperationState::Encoding).await;
                }
                self.events.started().await;
            }
            Notification::Progress { progress } => self.events.progress(progress).await,
            Notification::ScanCompleted { scan_json } => {
                self.events.scan_completed(scan_json).await
            }
            Notification::MessageLogged { text } => {
                for line in text.lines() {
                    debug!(target: "vidrelay::worker", pid, "{}", line);
                }
                self.events
                    .log(LogEntry::message(LogSource::Engine, text))
                    .await;
            }
            Notification::ErrorLogged { text } => {
                warn!(target: "vidrelay::worker", pid, "{}", text);
                self.events.log(LogEntry::error(LogSource::Engine, text)).await;
            }
            Notification::Exception { text } => {
                error!(target: "vidrelay::worker", pid, "{}", text);
                self.events.log(LogEntry::error(LogSource::Worker, text)).await;
            }
            Notification::Completed { result } => {
                self.complete(session, result).await;
                return true;
            }
        }
        false
    }

    async fn complete(&self, session: &WorkerSession, result: CompletionResult) {
        if !self.end().await {
            debug!("completion after operation already ended");
            return;
        }
        info!(pid = session.handle.pid, code = %result.code, "operation completed");
        session.channel.close().await;
        self.lifecycle.teardown(&session.handle, false).await;
        self.lifecycle.crash_logs().remove(session.handle.pid);
        self.events.complete(result.with_teardown(true)).await;
    }

    /// End the operation after a fault and report it once.
    async fn recover(&self, session: &WorkerSession, fault: RelayError) {
        if !self.end().await {
            debug!(error = %fault, "fault after operation already ended");
            return;
        }
        let pid = session.handle.pid;
        warn!(pid, error = %fault, "worker failed, recovering");

        let error = self.classify(&session.handle, fault).await;
        self.lifecycle.teardown(&session.handle, true).await;
        session.channel.close().await;
        self.lifecycle.crash_logs().remove(pid);

        error!(pid, error = %error, "operation failed");
        let result = CompletionResult::new(error.result_code())
            .with_detail(error.to_string())
            .with_teardown(true);
        self.events.failed(error).await;
        self.events.complete(result).await;
    }
}

/// Single consumer of worker notifications and faults for one operation.
async fn dispatch(
    inner: Arc<ProxyInner>,
    session: WorkerSession,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut faults: mpsc::UnboundedReceiver<RelayError>,
    monitor: JoinHandle<()>,
    scan_only: bool,
) {
    loop {
        tokio::select! {
            biased;
            event = channel_events.recv() => match event {
                Some(ChannelEvent::Notification(notification)) => {
                    session.handle.touch();
                    if inner.on_notification(&session, notification, scan_only).await {
                        break;
                    }
                }
                Some(ChannelEvent::Closed { reason }) => {
                    inner.recover(&session, RelayError::transport("connection", reason)).await;
                    break;
                }
                None => {
                    inner
                        .recover(&session, RelayError::transport("connection", "channel dropped"))
                        .await;
                    break;
                }
            },
            Some(fault) = faults.recv() => {
                // Notifications that arrived before the fault are still delivered.
                let mut completed = false;
                while let Ok(event) = channel_events.try_recv() {
                    if let ChannelEvent::Notification(notification) = event {
                        if inner.on_notification(&session, notification, scan_only).await {
                            completed = true;
                            break;
                        }
                    }
                }
                if !completed {
                    inner.recover(&session, fault).await;
                }
                break;
            }
        }
    }

    monitor.abort();
    *inner.session.lock().await = None;
    debug!(pid = session.handle.pid, "dispatch finished");
}

/// Health-check view of a live session.
struct SessionPinger {
    session: WorkerSession,
    state: watch::Receiver<OperationState>,
}

#[async_trait]
impl PingTarget for SessionPinger {
    async fn ping(&self) -> Result<()> {
        self.session.channel.ping().await?;
        self.session.handle.touch();
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.borrow().is_active()
    }

    fn has_exited(&self) -> bool {
        self.session.handle.has_exited()
    }

    fn since_last_communication(&self) -> Duration {
        self.session.handle.since_last_communication()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn proxy_for(executable: &std::path::Path, dir: &TempDir) -> OperationProxy {
        let mut config = RelayConfig::default();
        config.worker.executable = executable.to_path_buf();
        config.logging.temp_root = Some(dir.path().to_path_buf());
        OperationProxy::new(config).0
    }

    #[tokio::test]
    async fn test_spawn_failure_is_returned_and_finishes() {
        let dir = TempDir::new().unwrap();
        let (proxy, mut events) = {
            let mut config = RelayConfig::default();
            config.worker.executable = dir.path().join("missing-worker");
            config.logging.temp_root = Some(dir.path().to_path_buf());
            OperationProxy::new(config)
        };

        let err = proxy
            .start(Operation::Scan {
                path: "/movies/a.mkv".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::SpawnFailure { .. }));
        assert_eq!(proxy.state(), OperationState::Finished);

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(matches!(
            seen.as_slice(),
            [OperationEvent::StateChanged(OperationState::Finished)]
        ));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_for(&dir.path().join("missing-worker"), &dir);
        let operation = Operation::Scan { path: "/a".into() };
        assert!(proxy.start(operation.clone()).await.is_err());
        assert!(matches!(
            proxy.start(operation).await,
            Err(RelayError::OperationInProgress)
        ));
    }

    #[tokio::test]
    async fn test_controls_before_start() {
        let dir = TempDir::new().unwrap();
        let proxy = proxy_for(&dir.path().join("missing-worker"), &dir);

        assert!(matches!(
            proxy.pause().await,
            Err(RelayError::InvalidState { .. })
        ));
        assert!(matches!(
            proxy.resume().await,
            Err(RelayError::InvalidState { .. })
        ));
        proxy.stop().await.unwrap();
        proxy.stop_and_wait().await.unwrap();
        assert!(proxy.update_cpu_throttling(0.5).await.is_err());
        assert!(proxy.update_cpu_throttling(0.0).await.is_err());
        assert_eq!(proxy.worker_pid().await, None);
        assert_eq!(proxy.state(), OperationState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_exhaustion_kills_worker_and_finishes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid.txt");
        let script = dir.path().join("worker.sh");
        let body = format!(
            "#!/bin/sh\necho $$ > '{}'\n\
             mkdir -p \"$VIDRELAY_TEMP_ROOT/$VIDRELAY_WORKER_LOG_FOLDER\"\n\
             echo 'listener never bound' >> \"$VIDRELAY_TEMP_ROOT/$VIDRELAY_WORKER_LOG_FOLDER/$$.txt\"\n\
             echo ready\nexec sleep 30\n",
            pid_file.display()
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = RelayConfig::default();
        config.worker.executable = script;
        config.worker.connect_retries = 3;
        config.worker.connect_retry_interval_ms = 20;
        config.logging.temp_root = Some(dir.path().to_path_buf());
        let crash_folder = config.crash_log_folder();
        let (proxy, mut events) = OperationProxy::new(config);

        let err = proxy.start(Operation::Scan { path: "/a".into() }).await.unwrap_err();
        match &err {
            RelayError::ConnectFailure { attempts, crash_log, .. } => {
                assert_eq!(*attempts, 3);
                assert_eq!(crash_log.as_deref(), Some("listener never bound"));
            }
            other => panic!("expected a connect failure, got {other:?}"),
        }
        assert_eq!(proxy.state(), OperationState::Finished);

        let pid: u32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(!crate::server::process_alive(pid));
        assert!(!crash_folder.exists());

        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            seen.push(event);
        }
        assert!(matches!(
            seen.as_slice(),
            [OperationEvent::StateChanged(OperationState::Finished)]
        ));
    }
}
