//! Error types for stepledger.
//!
//! Library crates use [`StepLedgerError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::types::StepStatus;

/// Top-level error type for all stepledger operations.
#[derive(Debug, thiserror::Error)]
pub enum StepLedgerError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A pipeline step failed, returned a non-SUCCESS status, or broke the
    /// step contract. The step log has already been persisted.
    #[error("step {index} ({name}, key '{key}') finished with {status}: {cause}")]
    StepExecution {
        index: usize,
        name: String,
        key: String,
        status: StepStatus,
        cause: String,
    },

    /// Storage layer error that is not a plain I/O failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted file parsed but is structurally invalid.
    #[error("corrupt file {path:?}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// Network/HTTP error in the fetch collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Bad pipeline definition or bad input.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StepLedgerError>;

impl StepLedgerError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether this error came from a step rather than from the ledger itself.
    pub fn is_step_failure(&self) -> bool {
        matches!(self, Self::StepExecution { .. })
    }
}
