//! Shared type definitions used across vidrelay crates.
//!
//! These types travel between the host and the worker process, so every one
//! of them is serde-serializable and forwarded unmodified over the pipe.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a single scan or encode operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// No worker has been started yet
    #[default]
    NotStarted,
    /// The worker is resolving the source (always precedes encoding)
    Scanning,
    /// The engine is encoding
    Encoding,
    /// The engine is paused mid-encode
    Paused,
    /// A stop was requested and the worker has not confirmed completion yet
    Stopping,
    /// Terminal; the worker handle and channel are gone
    Finished,
}

impl OperationState {
    /// Returns true while a worker is attached to the operation.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Encoding | Self::Paused | Self::Stopping
        )
    }

    /// Returns true once the operation can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Scanning => write!(f, "scanning"),
            Self::Encoding => write!(f, "encoding"),
            Self::Paused => write!(f, "paused"),
            Self::Stopping => write!(f, "stopping"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// Snapshot of engine progress. Produced by the worker, forwarded unmodified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Fraction complete in `0.0..=1.0`
    pub fraction_complete: f64,
    /// Current rate in frames per second
    #[serde(default)]
    pub current_rate: Option<f64>,
    /// Average rate in frames per second
    #[serde(default)]
    pub average_rate: Option<f64>,
    /// Estimated time remaining in seconds
    #[serde(default)]
    pub estimated_seconds_left: Option<f64>,
    /// Engine-specific pass identifier
    #[serde(default)]
    pub pass_id: i32,
    /// 1-based pass number
    #[serde(default = "default_pass")]
    pub pass: u32,
    /// Total number of passes
    #[serde(default = "default_pass")]
    pub pass_count: u32,
    /// Opaque engine state code
    #[serde(default)]
    pub state_code: i32,
}

fn default_pass() -> u32 {
    1
}

impl ProgressEvent {
    /// Create a single-pass progress snapshot.
    pub fn new(fraction_complete: f64) -> Self {
        Self {
            fraction_complete: fraction_complete.clamp(0.0, 1.0),
            current_rate: None,
            average_rate: None,
            estimated_seconds_left: None,
            pass_id: 0,
            pass: 1,
            pass_count: 1,
            state_code: 0,
        }
    }

    /// Set current and average rates.
    pub fn with_rates(mut self, current: Option<f64>, average: Option<f64>) -> Self {
        self.current_rate = current;
        self.average_rate = average;
        self
    }

    /// Set the estimated time remaining.
    pub fn with_eta(mut self, seconds_left: f64) -> Self {
        self.estimated_seconds_left = Some(seconds_left.max(0.0));
        self
    }

    /// Set pass information.
    pub fn with_pass(mut self, pass_id: i32, pass: u32, pass_count: u32) -> Self {
        self.pass_id = pass_id;
        self.pass = pass;
        self.pass_count = pass_count;
        self
    }

    /// Percentage complete, rounded down.
    pub fn percent(&self) -> u8 {
        (self.fraction_complete * 100.0).floor() as u8
    }
}

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// The native encoding engine
    Engine,
    /// The worker process supervising the engine
    Worker,
    /// The host process
    Host,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine => write!(f, "engine"),
            Self::Worker => write!(f, "worker"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSeverity {
    Message,
    Error,
}

/// A single log line surfaced to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: LogSource,
    pub severity: LogSeverity,
    pub text: String,
    pub logged_at: DateTime<Utc>,
}

impl LogEntry {
    /// Create a routine message entry.
    pub fn message(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            severity: LogSeverity::Message,
            text: text.into(),
            logged_at: Utc::now(),
        }
    }

    /// Create an error entry.
    pub fn error(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            severity: LogSeverity::Error,
            text: text.into(),
            logged_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == LogSeverity::Error
    }
}

/// Outcome category of a finished operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// The scan or encode completed
    Success,
    /// Stopped on request
    Cancelled,
    /// The engine reported failure (e.g. the title could not be resolved)
    Failed,
    /// The worker could not be spawned, connected or set up
    StartFailure,
    /// The worker process crashed with captured detail
    WorkerCrash,
    /// The worker process exited without detail
    UnexpectedExit,
    /// The channel to the worker timed out or broke
    CommunicationFault,
}

impl ResultCode {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed => write!(f, "failed"),
            Self::StartFailure => write!(f, "start failure"),
            Self::WorkerCrash => write!(f, "worker crash"),
            Self::UnexpectedExit => write!(f, "unexpected exit"),
            Self::CommunicationFault => write!(f, "communication fault"),
        }
    }
}

/// Terminal result of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub code: ResultCode,
    /// Whether the worker is torn down as a consequence of this completion
    #[serde(default)]
    pub worker_torn_down: bool,
    /// Human-readable failure cause
    #[serde(default)]
    pub detail: Option<String>,
}

impl CompletionResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            worker_torn_down: false,
            detail: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn cancelled() -> Self {
        Self::new(ResultCode::Cancelled)
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self::new(ResultCode::Failed).with_detail(detail)
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_teardown(mut self, torn_down: bool) -> Self {
        self.worker_torn_down = torn_down;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code.is_success()
    }
}

/// Engine settings passed once at worker setup.
///
/// Immutable for the operation's lifetime except `cpu_throttling`, which the
/// worker applies directly when updated mid-operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationSnapshot {
    /// Engine log verbosity
    pub verbosity: u8,
    /// Number of preview frames generated during scan
    pub preview_count: u32,
    /// Use the engine's alternate scanner
    pub use_alternate_scanner: bool,
    /// Titles shorter than this are ignored by scan
    pub min_title_duration_secs: u32,
    /// Fraction of CPU cores the engine may use, in `(0.0, 1.0]`
    pub cpu_throttling: f64,
    /// Replaces the system temp folder for engine scratch files
    pub temp_folder_override: Option<PathBuf>,
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self {
        Self {
            verbosity: 1,
            preview_count: 10,
            use_alternate_scanner: false,
            min_title_duration_secs: 10,
            cpu_throttling: 1.0,
            temp_folder_override: None,
        }
    }
}

impl ConfigurationSnapshot {
    /// Set the CPU throttling fraction.
    pub fn with_cpu_throttling(mut self, fraction: f64) -> Self {
        self.cpu_throttling = fraction;
        self
    }

    /// Set the temp folder override.
    pub fn with_temp_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.temp_folder_override = Some(folder.into());
        self
    }
}

/// A single encode job. `settings` is opaque to the supervision layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Title to encode; `None` picks the main title
    #[serde(default)]
    pub title: Option<u32>,
    /// Engine-specific encode settings
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl EncodeJob {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            title: None,
            settings: serde_json::Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }
}

/// Everything the worker needs to start an encode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodeRequest {
    pub job: EncodeJob,
    /// Encode only this preview segment
    #[serde(default)]
    pub preview_index: Option<u32>,
    /// Length of the preview segment in seconds
    #[serde(default)]
    pub preview_seconds: Option<u32>,
    /// Format for unnamed chapters, e.g. `Chapter {0}`
    #[serde(default = "default_chapter_name_format")]
    pub default_chapter_name_format: String,
}

fn default_chapter_name_format() -> String {
    "Chapter {0}".to_string()
}

impl EncodeRequest {
    pub fn new(job: EncodeJob) -> Self {
        Self {
            job,
            preview_index: None,
            preview_seconds: None,
            default_chapter_name_format: default_chapter_name_format(),
        }
    }

    /// Restrict the encode to a preview segment.
    pub fn with_preview(mut self, index: u32, seconds: u32) -> Self {
        self.preview_index = Some(index);
        self.preview_seconds = Some(seconds);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_state_activity() {
        assert!(!OperationState::NotStarted.is_active());
        assert!(OperationState::Scanning.is_active());
        assert!(OperationState::Paused.is_active());
        assert!(OperationState::Stopping.is_active());
        assert!(!OperationState::Finished.is_active());
        assert!(OperationState::Finished.is_terminal());
    }

    #[test]
    fn test_progress_event_clamps_fraction() {
        assert_eq!(ProgressEvent::new(1.7).fraction_complete, 1.0);
        assert_eq!(ProgressEvent::new(-0.2).fraction_complete, 0.0);
        assert_eq!(ProgressEvent::new(0.456).percent(), 45);
    }

    #[test]
    fn test_progress_event_defaults_from_sparse_json() {
        let event: ProgressEvent = serde_json::from_str(r#"{"fraction_complete":0.5}"#).unwrap();
        assert_eq!(event.pass, 1);
        assert_eq!(event.pass_count, 1);
        assert!(event.current_rate.is_none());
    }

    #[test]
    fn test_completion_result_builders() {
        let result = CompletionResult::failed("title not found").with_teardown(true);
        assert_eq!(result.code, ResultCode::Failed);
        assert_eq!(result.detail.as_deref(), Some("title not found"));
        assert!(result.worker_torn_down);
        assert!(!result.is_success());
        assert!(CompletionResult::success().is_success());
    }

    #[test]
    fn test_configuration_snapshot_defaults() {
        let snapshot = ConfigurationSnapshot::default();
        assert_eq!(snapshot.preview_count, 10);
        assert_eq!(snapshot.cpu_throttling, 1.0);

        let parsed: ConfigurationSnapshot = serde_json::from_str(r#"{"verbosity":2}"#).unwrap();
        assert_eq!(parsed.verbosity, 2);
        assert_eq!(parsed.min_title_duration_secs, 10);
    }

    #[test]
    fn test_encode_request_default_chapter_format() {
        let json = r#"{"job":{"source":"/in.mkv","destination":"/out.mp4"}}"#;
        let request: EncodeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.default_chapter_name_format, "Chapter {0}");
        assert!(request.job.settings.is_null());
        assert!(request.preview_index.is_none());
    }

    #[test]
    fn test_log_entry_severity() {
        assert!(LogEntry::error(LogSource::Engine, "boom").is_error());
        assert!(!LogEntry::message(LogSource::Host, "hello").is_error());
    }
}
