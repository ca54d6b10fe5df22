//! Deterministic engine for debugging the supervision layer.
//!
//! Runs a fixed number of progress steps per operation. `VIDRELAY_SIMULATE`
//! picks a failure to inject a third of the way through:
//!
//! | value    | behaviour                                              |
//! |----------|--------------------------------------------------------|
//! | `normal` | completes successfully (default)                       |
//! | `slow`   | completes successfully with long steps                 |
//! | `fail`   | reports an error and a failed completion              |
//! | `crash`  | logs an error, then aborts the process                 |
//! | `exit`   | exits the process with code 3 without completing       |
//! | `hang`   | stops the whole process (SIGSTOP) so pings time out    |
//! | `panic`  | panics inside the engine job                           |

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use vidrelay_core::{
    CompletionResult, ConfigurationSnapshot, EncodeRequest, ProgressEvent, RelayError, Result,
};

use crate::engine::{Engine, EngineEvent, spawn_job};

/// Environment variable selecting the simulated behaviour.
pub const SIMULATE_ENV: &str = "VIDRELAY_SIMULATE";

const ENCODE_STEPS: u32 = 10;
const SCAN_STEPS: u32 = 2;

/// Injected behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Simulation {
    #[default]
    Normal,
    Slow,
    Fail,
    Crash,
    Exit,
    Hang,
    Panic,
}

impl Simulation {
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" | "" => Some(Self::Normal),
            "slow" => Some(Self::Slow),
            "fail" => Some(Self::Fail),
            "crash" => Some(Self::Crash),
            "exit" => Some(Self::Exit),
            "hang" => Some(Self::Hang),
            "panic" => Some(Self::Panic),
            _ => None,
        }
    }

    /// Time between progress steps.
    pub fn step(&self) -> Duration {
        match self {
            Self::Slow => Duration::from_millis(500),
            _ => Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
enum Job {
    Scan { path: String },
    Encode { source: String },
}

/// Engine that pretends to scan and encode.
pub struct SimulatedEngine {
    simulation: Simulation,
    step: Duration,
    events: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    control: Mutex<Option<watch::Sender<Run>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    throttling_bits: AtomicU64,
}

impl SimulatedEngine {
    pub fn new(simulation: Simulation) -> Self {
        Self {
            simulation,
            step: simulation.step(),
            events: Mutex::new(None),
            control: Mutex::new(None),
            task: Mutex::new(None),
            throttling_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Behaviour from `VIDRELAY_SIMULATE`; unknown values fall back to normal.
    pub fn from_env() -> Self {
        let simulation = std::env::var(SIMULATE_ENV)
            .ok()
            .and_then(|v| Simulation::from_str_loose(&v))
            .unwrap_or_default();
        Self::new(simulation)
    }

    /// Override the step length.
    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    pub fn simulation(&self) -> Simulation {
        self.simulation
    }

    pub fn cpu_throttling(&self) -> f64 {
        f64::from_bits(self.throttling_bits.load(Ordering::Relaxed))
    }

    async fn start(&self, job: Job) -> Result<()> {
        let events = self
            .events
            .lock()
            .await
            .clone()
            .ok_or_else(|| RelayError::OperationFailure {
                message: "engine is not set up".into(),
            })?;

        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(RelayError::OperationInProgress);
        }

        let (control_tx, control_rx) = watch::channel(Run::Running);
        *self.control.lock().await = Some(control_tx);
        *task = Some(spawn_job(
            events.clone(),
            run(job, self.simulation, self.step, events, control_rx),
        ));
        Ok(())
    }

    async fn signal(&self, from: &[Run], to: Run) -> Result<()> {
        let control = self.control.lock().await;
        let Some(tx) = control.as_ref() else {
            return Err(RelayError::OperationFailure {
                message: "no operation is running".into(),
            });
        };
        tx.send_if_modified(|run| {
            if from.contains(run) {
                *run = to;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Engine for SimulatedEngine {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn set_up(
        &self,
        config: &ConfigurationSnapshot,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<()> {
        self.throttling_bits
            .store(config.cpu_throttling.to_bits(), Ordering::Relaxed);
        *self.events.lock().await = Some(events);
        info!(simulation = ?self.simulation, "simulated engine set up");
        Ok(())
    }

    async fn start_scan(&self, path: &str) -> Result<()> {
        self.start(Job::Scan {
            path: path.to_string(),
        })
        .await
    }

    async fn start_encode(&self, request: &EncodeRequest) -> Result<()> {
        self.start(Job::Encode {
            source: request.job.source.display().to_string(),
        })
        .await
    }

    async fn pause(&self) -> Result<()> {
        self.signal(&[Run::Running], Run::Paused).await
    }

    async fn resume(&self) -> Result<()> {
        self.signal(&[Run::Paused], Run::Running).await
    }

    async fn stop(&self) -> Result<()> {
        self.signal(&[Run::Running, Run::Paused], Run::Stopped).await
    }

    async fn set_cpu_throttling(&self, fraction: f64) -> Result<()> {
        self.throttling_bits
            .store(fraction.to_bits(), Ordering::Relaxed);
        debug!(fraction, "cpu throttling updated");
        Ok(())
    }
}

async fn run(
    job: Job,
    simulation: Simulation,
    step: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut control: watch::Receiver<Run>,
) {
    let send = |event: EngineEvent| {
        let _ = events.send(event);
    };

    let steps = match &job {
        Job::Scan { path } => {
            send(EngineEvent::Log(format!("Scanning {path}")));
            SCAN_STEPS
        }
        Job::Encode { source } => {
            send(EngineEvent::Log(format!("Encoding {source}")));
            ENCODE_STEPS
        }
    };

    if simulation == Simulation::Fail {
        let message = "No valid title found in source".to_string();
        send(EngineEvent::Error(message.clone()));
        send(EngineEvent::Completed(CompletionResult::failed(message)));
        return;
    }

    send(EngineEvent::Started);
    let trigger = (steps / 3).max(1);
    let mut done = 0;

    while done < steps {
        if !wait_running(&mut control).await {
            send(EngineEvent::Log("Operation cancelled".into()));
            send(EngineEvent::Completed(CompletionResult::cancelled()));
            return;
        }
        tokio::time::sleep(step).await;
        if *control.borrow() != Run::Running {
            continue;
        }

        done += 1;
        let fraction = f64::from(done) / f64::from(steps);
        let remaining = step.as_secs_f64() * f64::from(steps - done);
        send(EngineEvent::Progress(
            ProgressEvent::new(fraction)
                .with_rates(Some(24.0), Some(23.5))
                .with_eta(remaining),
        ));

        if done == trigger {
            inject(simulation, &send).await;
        }
    }

    if let Job::Scan { path } = &job {
        let scan = serde_json::json!({
            "path": path,
            "main_title": 1,
            "titles": [
                { "index": 1, "duration_secs": 5400, "chapters": 12 },
                { "index": 2, "duration_secs": 95, "chapters": 1 }
            ]
        });
        send(EngineEvent::ScanCompleted(scan.to_string()));
    }
    send(EngineEvent::Log("Operation finished".into()));
    send(EngineEvent::Completed(CompletionResult::success()));
}

/// Returns false once stopped.
async fn wait_running(control: &mut watch::Receiver<Run>) -> bool {
    match control.wait_for(|run| *run != Run::Paused).await {
        Ok(run) => *run == Run::Running,
        Err(_) => false,
    }
}

async fn inject(simulation: Simulation, send: &(impl Fn(EngineEvent) + Sync)) {
    match simulation {
        Simulation::Crash => {
            send(EngineEvent::Error(
                "Simulated engine fault: access violation in decoder".into(),
            ));
            // Give the worker time to record the error before dying.
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::abort();
        }
        Simulation::Exit => {
            send(EngineEvent::Log("Engine shutting down unexpectedly".into()));
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(3);
        }
        Simulation::Hang => {
            send(EngineEvent::Log("Engine stalled".into()));
            tokio::time::sleep(Duration::from_millis(200)).await;
            freeze().await;
        }
        Simulation::Panic => {
            send(EngineEvent::Log("Engine state corrupted".into()));
            panic!("simulated engine fault: decoder state corrupted");
        }
        Simulation::Normal | Simulation::Slow | Simulation::Fail => {}
    }
}

/// Stop the whole process without exiting it.
#[cfg(unix)]
async fn freeze() {
    // SAFETY: raise only delivers a signal to the calling process.
    unsafe {
        libc::raise(libc::SIGSTOP);
    }
}

#[cfg(not(unix))]
async fn freeze() {
    std::future::pending::<()>().await;
}
