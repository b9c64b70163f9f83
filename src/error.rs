//! Error types for sandbox lifecycle operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::SandboxState;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The path is empty, escapes the project root, or lies outside the sandbox root.
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    /// A file that the operation needs does not exist.
    #[error("{side} file not found: {path:?}")]
    NotFound { side: &'static str, path: PathBuf },

    /// The sandbox is not in a state where its paths can be reached.
    #[error("cannot {operation}: sandbox is {state}")]
    SandboxUnreachable {
        operation: &'static str,
        state: SandboxState,
    },

    /// Another operation holds the sandbox lock.
    #[error("sandbox is busy: lock held at {0:?}")]
    SandboxBusy(PathBuf),

    /// No command template (or sync rule) is registered for the file's extension.
    #[error("no {purpose} registered for extension {extension:?} ({path:?})")]
    UnsupportedExtension {
        path: PathBuf,
        extension: String,
        purpose: &'static str,
    },

    /// A teardown backup could not be written.
    #[error("failed to write backup of {source_path:?} to {backup_path:?}: {cause}")]
    BackupWriteError {
        source_path: PathBuf,
        backup_path: PathBuf,
        cause: String,
    },

    /// Neither the primary nor the fallback compose template exists.
    #[error("no compose template found (tried {primary:?} and {fallback:?})")]
    TemplateMissing { primary: PathBuf, fallback: PathBuf },

    /// A command inside the sandbox exceeded its time budget.
    #[error("command timed out after {after:?}: {command}")]
    Timeout { command: String, after: Duration },

    /// A backend command needed by a lifecycle operation exited unsuccessfully.
    #[error("{operation} failed with exit code {exit_code}: {stderr}")]
    BackendCommandFailed {
        operation: String,
        exit_code: i32,
        stderr: String,
    },

    /// The compose fragment could not be parsed or rendered.
    #[error("compose template error: {0}")]
    Compose(String),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;
