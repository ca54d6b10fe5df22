//! The encoding engine capability.
//!
//! The worker process (or the local executor) drives an [`Engine`]. Engines
//! start work and return immediately; everything that happens afterwards is
//! reported as [`EngineEvent`]s on the sender handed over in [`Engine::set_up`].

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use vidrelay_core::{
    CompletionResult, ConfigurationSnapshot, EncodeRequest, ProgressEvent, RelayError, Result,
};

use crate::ffmpeg::FfmpegEngine;
use crate::simulated::SimulatedEngine;

/// Environment variable selecting the engine in the worker binary.
pub const ENGINE_ENV: &str = "VIDRELAY_ENGINE";

/// Something the engine reports while working.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started,
    Progress(ProgressEvent),
    /// Routine log line
    Log(String),
    /// Error-severity log line
    Error(String),
    ScanCompleted(String),
    /// The engine job died without reporting completion
    Exception(String),
    /// The operation ended. No events follow.
    Completed(CompletionResult),
}

/// Opaque start/pause/stop capability over a native encoder.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &'static str;

    /// Initialize the engine. Called once before any operation.
    async fn set_up(
        &self,
        config: &ConfigurationSnapshot,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()>;

    /// Start scanning `path`.
    async fn start_scan(&self, path: &str) -> Result<()>;

    /// Start encoding.
    async fn start_encode(&self, request: &EncodeRequest) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Ask the running operation to stop. It still reports `Completed`.
    async fn stop(&self) -> Result<()>;

    /// Change the share of CPU the engine may use.
    async fn set_cpu_throttling(&self, fraction: f64) -> Result<()>;
}

/// Spawn an engine job whose panic is reported as [`EngineEvent::Exception`].
///
/// The job itself runs in an inner task; the returned handle belongs to the
/// task watching it.
pub fn spawn_job<F>(events: mpsc::UnboundedSender<EngineEvent>, job: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        match tokio::spawn(job).await {
            Ok(()) => {}
            Err(e) if e.is_panic() => {
                let message = format!("engine job panicked: {}", panic_message(&*e.into_panic()));
                error!("{}", message);
                let _ = events.send(EngineEvent::Exception(message));
            }
            Err(_) => debug!("engine job cancelled"),
        }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Available engine implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Ffmpeg,
    Simulated,
}

impl EngineKind {
    /// Parse from a string (case-insensitive).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Some(Self::Ffmpeg),
            "simulated" | "sim" => Some(Self::Simulated),
            _ => None,
        }
    }

    /// Engine named by `VIDRELAY_ENGINE`, defaulting to ffmpeg.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ENGINE_ENV) {
            Ok(value) => Self::from_str_loose(&value).ok_or_else(|| {
                RelayError::ConfigValidation {
                    message: format!("{ENGINE_ENV}={value} is not a known engine"),
                }
            }),
            Err(_) => Ok(Self::Ffmpeg),
        }
    }
}

/// Create an engine by kind.
pub fn create_engine(kind: EngineKind) -> Arc<dyn Engine> {
    match kind {
        EngineKind::Ffmpeg => Arc::new(FfmpegEngine::new()),
        EngineKind::Simulated => Arc::new(SimulatedEngine::from_env()),
    }
}

/// Create the engine selected by the environment.
pub fn create_engine_from_env() -> Result<Arc<dyn Engine>> {
    Ok(create_engine(EngineKind::from_env()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_parsing() {
        assert_eq!(EngineKind::from_str_loose("ffmpeg"), Some(EngineKind::Ffmpeg));
        assert_eq!(EngineKind::from_str_loose(" Simulated "), Some(EngineKind::Simulated));
        assert_eq!(EngineKind::from_str_loose("sim"), Some(EngineKind::Simulated));
        assert_eq!(EngineKind::from_str_loose("handbrake"), None);
    }

    #[test]
    #[serial_test::serial]
    fn test_engine_kind_from_env() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe { std::env::remove_var(ENGINE_ENV) };
        assert_eq!(EngineKind::from_env().unwrap(), EngineKind::Ffmpeg);

        unsafe { std::env::set_var(ENGINE_ENV, "simulated") };
        assert_eq!(EngineKind::from_env().unwrap(), EngineKind::Simulated);

        unsafe { std::env::set_var(ENGINE_ENV, "vlc") };
        assert!(matches!(
            EngineKind::from_env(),
            Err(RelayError::ConfigValidation { .. })
        ));

        unsafe { std::env::remove_var(ENGINE_ENV) };
    }

    async fn corrupt_decoder() {
        panic!("decoder state corrupted");
    }

    #[tokio::test]
    async fn test_spawn_job_reports_panic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_job(tx, corrupt_decoder())
            .await
            .unwrap();

        match rx.recv().await {
            Some(EngineEvent::Exception(text)) => {
                assert!(text.contains("decoder state corrupted"));
            }
            other => panic!("expected an exception, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_spawn_job_quiet_on_success() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job_tx = tx.clone();
        spawn_job(tx, async move {
            let _ = job_tx.send(EngineEvent::Completed(CompletionResult::success()));
        })
        .await
        .unwrap();

        assert!(matches!(rx.recv().await, Some(EngineEvent::Completed(_))));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_create_engine_names() {
        assert_eq!(create_engine(EngineKind::Ffmpeg).name(), "ffmpeg");
        assert_eq!(create_engine(EngineKind::Simulated).name(), "simulated");
    }
}
