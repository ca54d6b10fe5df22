//! Periodic liveness checking of a worker.
//!
//! A single repeating timer pings the worker while its operation is active.
//! The ping period is longer than the call timeout, so at most one ping is
//! outstanding. A failed ping only counts when it is corroborated:
//!
//! 1. **Process exited**: the worker is gone, escalate.
//! 2. **Silence window exceeded**: nothing heard for longer than the
//!    unresponsive window, escalate.
//! 3. Otherwise the failure is treated as a slow tick and ignored.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vidrelay_worker::health::{self, HealthMonitorConfig, PingTarget};
//!
//! fn watch_worker(target: Arc<dyn PingTarget>) {
//!     let (faults, _rx) = tokio::sync::mpsc::unbounded_channel();
//!     let _task = health::spawn(target, HealthMonitorConfig::default(), faults);
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use vidrelay_core::{RelayConfig, RelayError, Result};

/// Default ping interval in seconds.
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 6;

/// Default per-call timeout in seconds.
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 5;

/// Default silence window in seconds.
pub const DEFAULT_UNRESPONSIVE_WINDOW_SECS: u64 = 20;

/// Configuration for health monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthMonitorConfig {
    /// Time between pings
    pub ping_interval: Duration,
    /// Silence after which a failed ping is escalated
    pub unresponsive_window: Duration,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            unresponsive_window: Duration::from_secs(DEFAULT_UNRESPONSIVE_WINDOW_SECS),
        }
    }
}

impl HealthMonitorConfig {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            ping_interval: config.ping_interval(),
            unresponsive_window: config.unresponsive_window(),
        }
    }
}

/// Something that can be pinged.
#[async_trait]
pub trait PingTarget: Send + Sync {
    /// Issue one ping. Must be bounded by the call timeout.
    async fn ping(&self) -> Result<()>;

    /// Whether the operation still wants monitoring.
    fn is_active(&self) -> bool;

    /// Whether the worker process has exited.
    fn has_exited(&self) -> bool;

    /// Time since anything was last heard from the worker.
    fn since_last_communication(&self) -> Duration;
}

/// A ping failure that warrants recovery.
#[derive(Debug)]
pub struct HealthFailure {
    pub error: RelayError,
    pub process_exited: bool,
    pub silent_for: Duration,
}

/// Whether a failed ping should be escalated.
pub fn should_escalate(process_exited: bool, silent_for: Duration, window: Duration) -> bool {
    process_exited || silent_for > window
}

/// Ping `target` until it goes inactive or a failure is escalated.
pub async fn watch(target: &dyn PingTarget, config: HealthMonitorConfig) -> Option<HealthFailure> {
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if !target.is_active() {
            debug!("operation inactive, health monitor exiting");
            return None;
        }

        let error = match target.ping().await {
            Ok(()) => continue,
            Err(error) => error,
        };

        // The operation may have ended while the ping was in flight.
        if !target.is_active() {
            return None;
        }

        let process_exited = target.has_exited();
        let silent_for = target.since_last_communication();
        if should_escalate(process_exited, silent_for, config.unresponsive_window) {
            warn!(
                error = %error,
                process_exited,
                silent_ms = silent_for.as_millis() as u64,
                "worker unresponsive"
            );
            return Some(HealthFailure {
                error,
                process_exited,
                silent_for,
            });
        }

        debug!(
            error = %error,
            silent_ms = silent_for.as_millis() as u64,
            "ping failed, within unresponsive window"
        );
    }
}

/// Run [`watch`] in the background and post an escalated failure to `faults`.
pub fn spawn(
    target: Arc<dyn PingTarget>,
    config: HealthMonitorConfig,
    faults: mpsc::UnboundedSender<RelayError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Some(failure) = watch(target.as_ref(), config).await {
            let _ = faults.send(failure.error);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::Instant;

    struct FakeWorker {
        answers: AtomicBool,
        exited: AtomicBool,
        active: AtomicBool,
        pings: AtomicU32,
        last_heard: std::sync::Mutex<Instant>,
    }

    impl FakeWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                answers: AtomicBool::new(true),
                exited: AtomicBool::new(false),
                active: AtomicBool::new(true),
                pings: AtomicU32::new(0),
                last_heard: std::sync::Mutex::new(Instant::now()),
            })
        }
    }

    #[async_trait]
    impl PingTarget for FakeWorker {
        async fn ping(&self) -> Result<()> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if self.answers.load(Ordering::SeqCst) {
                *self.last_heard.lock().unwrap() = Instant::now();
                Ok(())
            } else {
                tokio::time::sleep(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)).await;
                Err(RelayError::timeout("ping", Duration::from_secs(5)))
            }
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }

        fn has_exited(&self) -> bool {
            self.exited.load(Ordering::SeqCst)
        }

        fn since_last_communication(&self) -> Duration {
            self.last_heard.lock().unwrap().elapsed()
        }
    }

    #[test]
    fn test_should_escalate() {
        let window = Duration::from_secs(20);
        assert!(!should_escalate(false, Duration::from_secs(11), window));
        assert!(should_escalate(true, Duration::from_secs(1), window));
        assert!(should_escalate(false, Duration::from_secs(21), window));
    }

    #[test]
    fn test_defaults_keep_one_ping_outstanding() {
        let config = HealthMonitorConfig::default();
        assert!(config.ping_interval > Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_slow_tick_is_tolerated() {
        let worker = FakeWorker::new();
        let monitor = {
            let worker = worker.clone();
            tokio::spawn(async move { watch(worker.as_ref(), HealthMonitorConfig::default()).await })
        };

        // Healthy for two ticks, then one failing ping, then healthy again.
        tokio::time::sleep(Duration::from_secs(13)).await;
        worker.answers.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(6)).await;
        worker.answers.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(12)).await;

        assert!(!monitor.is_finished());
        worker.active.store(false, Ordering::SeqCst);
        assert!(monitor.await.unwrap().is_none());
        assert!(worker.pings.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exited_process_escalates_on_first_failure() {
        let worker = FakeWorker::new();
        worker.answers.store(false, Ordering::SeqCst);
        worker.exited.store(true, Ordering::SeqCst);

        let failure = watch(worker.as_ref(), HealthMonitorConfig::default())
            .await
            .unwrap();
        assert!(failure.process_exited);
        assert!(failure.error.is_communication_fault());
        assert_eq!(worker.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_window_escalates() {
        let worker = FakeWorker::new();
        worker.answers.store(false, Ordering::SeqCst);

        let started = Instant::now();
        let failure = watch(worker.as_ref(), HealthMonitorConfig::default())
            .await
            .unwrap();
        assert!(!failure.process_exited);
        assert!(failure.silent_for > Duration::from_secs(20));
        // Pings at 6s, 12s and 18s (+5s timeout each); the one at 18s
        // completes at 23s, past the window.
        assert_eq!(worker.pings.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_posts_fault() {
        let worker = FakeWorker::new();
        worker.answers.store(false, Ordering::SeqCst);
        worker.exited.store(true, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = spawn(worker, HealthMonitorConfig::default(), tx);
        let fault = rx.recv().await.unwrap();
        assert!(fault.is_communication_fault());
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_target_is_not_pinged() {
        let worker = FakeWorker::new();
        worker.active.store(false, Ordering::SeqCst);
        assert!(watch(worker.as_ref(), HealthMonitorConfig::default()).await.is_none());
        assert_eq!(worker.pings.load(Ordering::SeqCst), 0);
    }
}
