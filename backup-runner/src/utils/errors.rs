//! Custom error types for the backup runner.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tool unavailable: could not start `{tool}`: {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{tool}` exited with {status}: {stderr}")]
    ToolFailed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Source not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Step timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Another backup run holds the lock at {}", .0.display())]
    Locked(PathBuf),

    #[error("Failed to remove {failed} of {eligible} expired backup sets")]
    PartialPrune { failed: usize, eligible: usize },

    #[error("Task join error: {0}")]
    Join(String),
}

/// Failure classes reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ToolUnavailable,
    IoFailure,
    PartialPruneFailure,
    Config,
}

impl BackupError {
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            BackupError::ToolUnavailable { .. } | BackupError::ToolFailed { .. } => {
                ErrorClass::ToolUnavailable
            }
            BackupError::Io(_)
            | BackupError::IoAt { .. }
            | BackupError::SourceMissing(_)
            | BackupError::Timeout(_)
            | BackupError::Join(_) => ErrorClass::IoFailure,
            BackupError::PartialPrune { .. } => ErrorClass::PartialPruneFailure,
            BackupError::Config(_) | BackupError::Locked(_) => ErrorClass::Config,
        }
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(e: tokio::task::JoinError) -> Self {
        BackupError::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
