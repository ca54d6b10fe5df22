//! Executor selection.
//!
//! The host drives an operation through [`OperationExecutor`] without caring
//! whether the engine runs in an isolated worker ([`OperationProxy`]) or in
//! the host itself ([`LocalOperationExecutor`]). The choice is made once, at
//! construction, from `worker.process_isolation`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use vidrelay_core::{EncodeRequest, OperationState, RelayConfig, Result};

use crate::engine::{Engine, EngineKind, create_engine};
use crate::events::OperationEvent;
use crate::local::LocalOperationExecutor;
use crate::proxy::OperationProxy;

/// The work one executor performs.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Scan a source and report its titles.
    Scan { path: String },
    /// Encode a structured request.
    Encode(EncodeRequest),
    /// Encode a request already serialized as JSON.
    EncodePayload(String),
}

impl Operation {
    pub fn is_scan(&self) -> bool {
        matches!(self, Self::Scan { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan { .. } => "scan",
            Self::Encode(_) | Self::EncodePayload(_) => "encode",
        }
    }
}

/// One scan or encode session.
///
/// Each executor runs at most one operation; start a new executor for the
/// next one.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Executor name for logs.
    fn name(&self) -> &'static str;

    /// Current state.
    fn state(&self) -> OperationState;

    /// Begin the operation.
    ///
    /// Start failures are returned here and the event stream closes without
    /// a completion. Everything after a successful start is reported as
    /// events.
    async fn start(&self, operation: Operation) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Request a stop. Returns once the request is sent.
    async fn stop(&self) -> Result<()>;

    /// Stop and wait, within a bounded time, for the operation to finish.
    async fn stop_and_wait(&self) -> Result<()>;

    /// Change the CPU share of the running operation.
    async fn update_cpu_throttling(&self, fraction: f64) -> Result<()>;
}

/// Build the executor selected by `config`.
///
/// `engine` is only used by the in-process executor. When it is `None` the
/// engine named by `VIDRELAY_ENGINE` is created.
pub fn create_executor(
    config: &RelayConfig,
    engine: Option<Arc<dyn Engine>>,
) -> Result<(Box<dyn OperationExecutor>, mpsc::UnboundedReceiver<OperationEvent>)> {
    if config.worker.process_isolation {
        info!(executable = %config.worker.executable.display(), "using worker process");
        let (proxy, events) = OperationProxy::new(config.clone());
        return Ok((Box::new(proxy), events));
    }

    let engine = match engine {
        Some(engine) => engine,
        None => create_engine(EngineKind::from_env()?),
    };
    info!(engine = engine.name(), "using in-process engine");
    let (local, events) = LocalOperationExecutor::new(engine, config.engine.clone());
    Ok((Box::new(local), events))
}
