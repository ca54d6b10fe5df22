//! Error types for vidrelay operations.
//!
//! This module defines [`RelayError`], the error enum shared by the host, the
//! worker process and the operation proxies. The supervision variants follow
//! the worker failure taxonomy: spawn, connect, communication, crash,
//! unexpected exit and engine-reported failure.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::{OperationState, ResultCode};

/// Result type alias using [`RelayError`].
pub type Result<T> = std::result::Result<T, RelayError>;

/// How a call over an established channel failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// No reply arrived within the call timeout.
    Timeout { after: Duration },
    /// The connection broke or could not be written.
    Transport { message: String },
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { after } => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Transport { message } => write!(f, "transport failure ({})", message),
        }
    }
}

/// Comprehensive error type for all vidrelay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file not found
    #[error("Configuration not found at {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration file is invalid YAML
    #[error("Invalid configuration at {path}: {message}")]
    ConfigInvalid { path: PathBuf, message: String },

    /// Configuration validation failed
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String },

    // =========================================================================
    // I/O and Parsing Errors
    // =========================================================================
    /// Generic I/O error with context
    #[error("I/O error {operation}: {path}")]
    Io {
        operation: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing error
    #[error("JSON parse error in {context}: {message}")]
    JsonParse {
        context: String,
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    /// A frame on the pipe did not match the protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // =========================================================================
    // Worker Supervision Errors
    // =========================================================================
    /// The worker executable could not be launched or never signalled readiness
    #[error("Failed to spawn worker: {message}")]
    SpawnFailure {
        message: String,
        crash_log: Option<String>,
    },

    /// The worker's pipe endpoint never accepted a connection
    #[error("Failed to connect to worker pipe {pipe_name} after {attempts} attempt(s): {message}")]
    ConnectFailure {
        pipe_name: String,
        attempts: u32,
        message: String,
        crash_log: Option<String>,
    },

    /// A call on an established channel timed out or the transport broke
    #[error("Communication with worker failed during {operation}: {kind}")]
    CommunicationFault { operation: String, kind: FaultKind },

    /// The worker process died and left error lines in its crash log
    #[error("Worker process {pid} crashed: {detail}")]
    WorkerCrash { pid: u32, detail: String },

    /// The worker process died without leaving any detail behind
    #[error("Worker process {pid} exited unexpectedly with code {}", exit_code_label(.exit_code))]
    UnexpectedExit { pid: u32, exit_code: Option<i32> },

    /// The worker itself reported that the encode or scan failed
    #[error("Operation failed: {message}")]
    OperationFailure { message: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// A control command arrived while the operation could not accept it
    #[error("Cannot {operation} while the operation is {state}")]
    InvalidState {
        operation: String,
        state: OperationState,
    },

    /// The proxy already ran (or is running) an operation
    #[error("An operation has already been started on this proxy")]
    OperationInProgress,

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (bug in vidrelay)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "unknown (terminated by signal)".to_string(),
    }
}

impl RelayError {
    // =========================================================================
    // Constructor helpers for common error patterns
    // =========================================================================

    /// Create a ConfigNotFound error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Self::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::JsonParse {
            context: context.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a spawn failure, optionally carrying crash log contents
    pub fn spawn_failure(message: impl Into<String>, crash_log: Option<String>) -> Self {
        Self::SpawnFailure {
            message: message.into(),
            crash_log,
        }
    }

    /// Create a call timeout fault
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::CommunicationFault {
            operation: operation.into(),
            kind: FaultKind::Timeout { after },
        }
    }

    /// Create a transport fault
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommunicationFault {
            operation: operation.into(),
            kind: FaultKind::Transport {
                message: message.into(),
            },
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: impl Into<String>, state: OperationState) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    // =========================================================================
    // Error classification helpers
    // =========================================================================

    /// Returns true for timeouts and broken transports on an established channel
    pub fn is_communication_fault(&self) -> bool {
        matches!(self, Self::CommunicationFault { .. })
    }

    /// Returns true if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigNotFound { .. } | Self::ConfigInvalid { .. } | Self::ConfigValidation { .. }
        )
    }

    /// Crash log contents attached to a spawn or connect failure
    pub fn crash_log(&self) -> Option<&str> {
        match self {
            Self::SpawnFailure { crash_log, .. } | Self::ConnectFailure { crash_log, .. } => {
                crash_log.as_deref()
            }
            Self::WorkerCrash { detail, .. } => Some(detail),
            _ => None,
        }
    }

    /// Result code reported on the completion notification for this failure
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::WorkerCrash { .. } => ResultCode::WorkerCrash,
            Self::UnexpectedExit { .. } => ResultCode::UnexpectedExit,
            Self::CommunicationFault { .. } => ResultCode::CommunicationFault,
            Self::SpawnFailure { .. } | Self::ConnectFailure { .. } => ResultCode::StartFailure,
            _ => ResultCode::Failed,
        }
    }

    /// Returns actionable guidance for the user
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            Self::ConfigNotFound { .. } => {
                Some("Create ~/.vidrelay/config.yaml or pass --config with a valid file")
            }
            Self::ConfigInvalid { .. } => Some("Check YAML syntax in the configuration file"),
            Self::SpawnFailure { .. } => {
                Some("Check that worker.executable points at the vidrelay-worker binary")
            }
            Self::ConnectFailure { .. } => {
                Some("The worker started but never opened its pipe - check the worker log")
            }
            Self::WorkerCrash { .. } | Self::UnexpectedExit { .. } => {
                Some("The encoding engine crashed - try the job again or with different settings")
            }
            _ => None,
        }
    }
}
