//! Per-process crash logs and failure classification.
//!
//! The worker appends every error-severity line to
//! `<temp_root>/<worker_log_folder>/<pid>.txt` as it happens, independent of
//! the pipe. When the channel becomes unusable the host reads that file to
//! decide what went wrong:
//!
//! | crash log        | process    | reported as                |
//! |------------------|------------|----------------------------|
//! | has error lines  | any        | `WorkerCrash` with detail  |
//! | empty or missing | exited     | `UnexpectedExit` with code |
//! | empty or missing | still alive| the original fault         |
//!
//! The host deletes the file (and the folder, once empty) after reading.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use vidrelay_core::config::{DEFAULT_WORKER_LOG_FOLDER, TEMP_ROOT_ENV, WORKER_LOG_FOLDER_ENV};
use vidrelay_core::{RelayConfig, RelayError, Result};

use crate::types::WorkerExit;

/// Location of the per-process crash logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashLogStore {
    folder: PathBuf,
}

impl CrashLogStore {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.crash_log_folder())
    }

    /// Resolve the folder from the environment the host passes to the worker.
    pub fn from_env() -> Self {
        let root = std::env::var_os(TEMP_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        let folder = std::env::var(WORKER_LOG_FOLDER_ENV)
            .unwrap_or_else(|_| DEFAULT_WORKER_LOG_FOLDER.to_string());
        Self::new(root.join(folder))
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn path_for(&self, pid: u32) -> PathBuf {
        self.folder.join(format!("{pid}.txt"))
    }

    /// Append one error line for `pid`. Embedded newlines are flattened so
    /// each error stays on a single line.
    pub fn append(&self, pid: u32, text: &str) -> Result<()> {
        std::fs::create_dir_all(&self.folder)
            .map_err(|e| RelayError::io("creating crash log folder", &self.folder, e))?;

        let path = self.path_for(pid);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| RelayError::io("opening crash log", &path, e))?;

        let line = flatten(text);
        writeln!(file, "{line}").map_err(|e| RelayError::io("writing crash log", &path, e))?;
        Ok(())
    }

    /// Error lines recorded for `pid`, or `None` when nothing was captured.
    pub fn read(&self, pid: u32) -> Option<String> {
        let path = self.path_for(pid);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let trimmed = content.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read crash log");
                None
            }
        }
    }

    /// Delete the log for `pid`, then the folder if nothing else is in it.
    ///
    /// Other workers may still be writing their own logs into the folder, so
    /// a non-empty folder is left alone.
    pub fn remove(&self, pid: u32) {
        let path = self.path_for(pid);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed crash log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove crash log"),
        }
        if std::fs::remove_dir(&self.folder).is_ok() {
            debug!(folder = %self.folder.display(), "removed empty crash log folder");
        }
    }
}

fn flatten(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Turn a failure observed on the host into the single error reported for
/// the operation.
///
/// `fault` is what the host saw first (a failed call, a closed channel);
/// it is returned unchanged only when neither the crash log nor the exit
/// status explains it.
pub fn classify(
    pid: u32,
    exit: Option<WorkerExit>,
    crash_log: Option<String>,
    fault: RelayError,
) -> RelayError {
    if let Some(detail) = crash_log {
        return RelayError::WorkerCrash { pid, detail };
    }
    match exit {
        Some(exit) => RelayError::UnexpectedExit {
            pid,
            exit_code: exit.code,
        },
        None => fault,
    }
}
