//! # vidrelay-core
//!
//! Core types, errors, configuration and logging shared by the vidrelay host
//! and its worker process.
//!
//! This crate provides:
//! - [`RelayError`] - Error type for every supervision and operation failure
//! - [`config`] - YAML configuration with timeouts, health and logging settings
//! - [`logging`] - Tracing setup for the host and worker processes
//! - [`types`] - Operation state, progress, logs and completion results
//!
//! ## Example
//!
//! ```no_run
//! use vidrelay_core::{RelayConfig, logging};
//!
//! fn main() -> vidrelay_core::Result<()> {
//!     let _guard = logging::init_logging(None, false)?;
//!     let config = RelayConfig::load()?;
//!     tracing::info!(isolation = config.worker.process_isolation, "config loaded");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::RelayConfig;
pub use error::{FaultKind, RelayError, Result};
pub use logging::{LogGuard, init_logging, init_worker_logging};
pub use types::{
    CompletionResult, ConfigurationSnapshot, EncodeJob, EncodeRequest, LogEntry, LogSeverity,
    LogSource, OperationState, ProgressEvent, ResultCode,
};
