//! In-process executor.
//!
//! Drives an [`Engine`] directly inside the host, bypassing the worker
//! process and the pipe. Used for debugging. The event stream and state
//! machine are the same as for [`OperationProxy`], but an engine crash takes
//! the host down with it.
//!
//! [`OperationProxy`]: crate::proxy::OperationProxy

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument, warn};

use vidrelay_core::{
    CompletionResult, ConfigurationSnapshot, EncodeRequest, LogEntry, LogSource, OperationState,
    RelayError, Result,
};

use crate::engine::{Engine, EngineEvent};
use crate::events::{EventRelay, OperationEvent};
use crate::executor::{Operation, OperationExecutor};
use crate::state::{Control, StateMachine, plan};

/// How long `stop_and_wait` waits for the engine to complete.
const STOP_WAIT: Duration = Duration::from_secs(10);

struct LocalInner {
    engine: Arc<dyn Engine>,
    config: ConfigurationSnapshot,
    state: StateMachine,
    events: EventRelay,
    process_lock: Mutex<()>,
    command_lock: Mutex<()>,
    started: AtomicBool,
}

/// Runs one operation on an engine in the host process.
pub struct LocalOperationExecutor {
    inner: Arc<LocalInner>,
}

impl LocalOperationExecutor {
    pub fn new(
        engine: Arc<dyn Engine>,
        config: ConfigurationSnapshot,
    ) -> (Self, mpsc::UnboundedReceiver<OperationEvent>) {
        let (events, events_rx) = EventRelay::new();
        let inner = LocalInner {
            engine,
            config,
            state: StateMachine::new(),
            events,
            process_lock: Mutex::new(()),
            command_lock: Mutex::new(()),
            started: AtomicBool::new(false),
        };
        let executor = Self {
            inner: Arc::new(inner),
        };
        (executor, events_rx)
    }
}

impl LocalInner {
    async fn enter(&self, to: OperationState) -> bool {
        let _lock = self.process_lock.lock().await;
        match self.state.transition(to) {
            Ok(_) => {
                self.events.state_changed(to).await;
                true
            }
            Err(e) => {
                debug!(error = %e, "transition skipped");
                false
            }
        }
    }

    async fn end(&self) -> bool {
        let _lock = self.process_lock.lock().await;
        if !self.state.finish() {
            return false;
        }
        self.events.state_changed(OperationState::Finished).await;
        true
    }

    /// End the operation with `error` unless it already ended.
    async fn fail(&self, error: RelayError) {
        if !self.end().await {
            return;
        }
        warn!(error = %error, "local operation failed");
        let result = CompletionResult::new(error.result_code()).with_detail(error.to_string());
        self.events.failed(error).await;
        self.events.complete(result).await;
    }

    /// Relay engine events until the engine completes.
    async fn pump(self: Arc<Self>, mut engine_events: mpsc::UnboundedReceiver<EngineEvent>, scan_only: bool) {
        while let Some(event) = engine_events.recv().await {
            match event {
                EngineEvent::Started => {
                    if !scan_only && self.state.state() == OperationState::Scanning {
                        self.enter(OperationState::Encoding).await;
                    }
                    self.events.started().await;
                }
                EngineEvent::Progress(progress) => self.events.progress(progress).await,
                EngineEvent::Log(text) => {
                    debug!(target: "vidrelay::engine", "{}", text);
                    self.events.log(LogEntry::message(LogSource::Engine, text)).await;
                }
                EngineEvent::Error(text) => {
                    warn!(target: "vidrelay::engine", "{}", text);
                    self.events.log(LogEntry::error(LogSource::Engine, text)).await;
                }
                EngineEvent::ScanCompleted(scan_json) => {
                    self.events.scan_completed(scan_json).await
                }
                EngineEvent::Exception(text) => {
                    error!(target: "vidrelay::engine", "{}", text);
                    self.events.log(LogEntry::error(LogSource::Engine, text.clone())).await;
                    if self.end().await {
                        self.events
                            .complete(CompletionResult::failed(text).with_teardown(false))
                            .await;
                    }
                    return;
                }
                EngineEvent::Completed(result) => {
                    if self.end().await {
                        info!(code = %result.code, "operation completed");
                        self.events.complete(result.with_teardown(false)).await;
                    }
                    return;
                }
            }
        }
        self.fail(RelayError::OperationFailure {
            message: "engine stopped without completing".into(),
        })
        .await;
    }
}

#[async_trait]
impl OperationExecutor for LocalOperationExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn state(&self) -> OperationState {
        self.inner.state.state()
    }

    #[instrument(level = "info", skip_all, fields(operation = operation.name(), engine = self.inner.engine.name()))]
    async fn start(&self, operation: Operation) -> Result<()> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(RelayError::OperationInProgress);
        }

        let prepared = match &operation {
            Operation::EncodePayload(payload) => serde_json::from_str::<EncodeRequest>(payload)
                .map(Some)
                .map_err(|e| RelayError::json_parse("encode payload", e)),
            Operation::Encode(request) => Ok(Some(request.clone())),
            Operation::Scan { .. } => Ok(None),
        };
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let set_up = match prepared {
            Ok(request) => inner
                .engine
                .set_up(&inner.config, engine_tx)
                .await
                .map(|()| request),
            Err(e) => Err(e),
        };
        let request = match set_up {
            Ok(request) => request,
            Err(e) => {
                inner.end().await;
                inner.events.close().await;
                return Err(e);
            }
        };

        inner.enter(OperationState::Scanning).await;
        tokio::spawn(inner.clone().pump(engine_rx, operation.is_scan()));

        let outcome = match (&operation, request) {
            (Operation::Scan { path }, _) => inner.engine.start_scan(path).await,
            (_, Some(request)) => inner.engine.start_encode(&request).await,
            (_, None) => Err(RelayError::internal("encode without a request")),
        };
        if let Err(e) = outcome {
            inner.fail(e).await;
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
        self.control(Control::Stop).await?;
        let inner = &self.inner;
        if inner.state.state() == OperationState::NotStarted {
            return Ok(());
        }
        if tokio::time::timeout(STOP_WAIT, inner.state.wait_finished())
            .await
            .is_err()
        {
            inner.fail(RelayError::timeout("stop", STOP_WAIT)).await;
        }
        Ok(())
    }

    async fn update_cpu_throttling(&self, fraction: f64) -> Result<()> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(RelayError::ConfigValidation {
                message: format!("cpu throttling must be in (0, 1], got {fraction}"),
            });
        }
        let state = self.inner.state.state();
        if !state.is_active() {
            return Err(RelayError::invalid_state("update cpu throttling", state));
        }
        self.inner.engine.set_cpu_throttling(fraction).await
    }
}

impl LocalOperationExecutor {
    async fn control(&self, control: Control) -> Result<()> {
        let inner = &self.inner;
        let _command = inner.command_lock.lock().await;
        let state = inner.state.state();
        let Some(next) = plan(control, state)? else {
            return Ok(());
        };
        match control {
            Control::Pause => inner.engine.pause().await?,
            Control::Resume => inner.engine.resume().await?,
            Control::Stop => inner.engine.stop().await?,
        }
        inner.enter(next).await;
        Ok(())
    }
}
