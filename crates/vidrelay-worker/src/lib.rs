//! Worker supervision for vidrelay.
//!
//! This crate runs a crash-prone encoding engine in a separate process and
//! talks to it over a duplex pipe, so that an engine crash or hang ends one
//! operation instead of the host.
//!
//! # Overview
//!
//! - Spawn a worker, wait for its ready line and connect to its pipe
//! - Send calls (set up, start, pause, resume, stop, ping) with timeouts
//! - Relay the worker's notifications (progress, logs, completion) in order
//! - Ping the worker periodically and recover from crashes and hangs
//! - Report exactly one outcome per operation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐          ┌──────────────────────┐
//! │   OperationProxy     │          │ LocalOperationExecutor│
//! │ (state machine)      │          │ (in-process engine)  │
//! └──────────┬───────────┘          └──────────────────────┘
//!            │ WorkerLifecycle / DuplexChannel / health
//!            ▼
//! ┌──────────────────────┐
//! │  vidrelay-worker     │  <parent_pid> <pipe_name>
//! │  WorkerServer        │──▶ crash log <temp_root>/<folder>/<pid>.txt
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  Engine (ffmpeg or   │
//! │  simulated)          │
//! └──────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vidrelay_core::RelayConfig;
//! use vidrelay_worker::{Operation, OperationEvent, create_executor};
//!
//! #[tokio::main]
//! async fn main() -> vidrelay_core::Result<()> {
//!     let config = RelayConfig::load()?;
//!     let (executor, mut events) = create_executor(&config, None)?;
//!
//!     executor
//!         .start(Operation::Scan { path: "/movies/feature.mkv".into() })
//!         .await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let OperationEvent::Completed(result) = event {
//!             println!("finished: {}", result.code);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Worker Protocol
//!
//! The worker executable:
//! 1. Accepts the host pid and a pipe name as positional arguments, followed
//!    by the host's `-v` and `--log-dir <dir>` options when set
//! 2. Listens on the pipe, then prints `ready` on stdout
//! 3. Serves newline-delimited JSON calls and pushes notifications
//! 4. Appends error lines to its crash log independently of the pipe
//!
//! Environment variables passed to the worker:
//! - `VIDRELAY_TEMP_ROOT`: root of the crash log folder
//! - `VIDRELAY_WORKER_LOG_FOLDER`: crash log folder name
//! - `VIDRELAY_LOG_FLUSH_MS`: batching interval for routine log lines
//! - `VIDRELAY_ENGINE`: `ffmpeg` (default) or `simulated`
//! - `VIDRELAY_SIMULATE`: simulated engine behaviour (`normal`, `slow`,
//!   `fail`, `crash`, `exit`, `hang`, `panic`)

pub mod channel;
pub mod crash_log;
pub mod engine;
pub mod events;
pub mod executor;
pub mod ffmpeg;
pub mod health;
pub mod lifecycle;
pub mod local;
pub mod log_aggregator;
pub mod protocol;
pub mod proxy;
pub mod server;
pub mod simulated;
pub mod state;
pub mod transport;
pub mod types;


// Re-export main types for convenience
pub use channel::{ChannelEvent, DuplexChannel};
pub use crash_log::CrashLogStore;
pub use engine::{Engine, EngineEvent, EngineKind, create_engine, create_engine_from_env};
pub use events::OperationEvent;
pub use executor::{Operation, OperationExecutor, create_executor};
pub use lifecycle::WorkerLifecycle;
pub use local::LocalOperationExecutor;
pub use proxy::OperationProxy;
pub use server::{WorkerServer, flush_interval_from_env, install_panic_hook};
pub use types::{LaunchConfig, WorkerExit, WorkerHandle};
