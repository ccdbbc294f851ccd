//! Error types for Conveyor.
//!
//! Library crates use [`ConveyorError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use crate::context::ContextError;

/// Top-level error type for all Conveyor operations.
#[derive(Debug, thiserror::Error)]
pub enum ConveyorError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external service.
    #[error("network error: {0}")]
    Network(String),

    /// The remote build backend rejected or failed a request.
    #[error("build backend error: {0}")]
    Backend(String),

    /// The remote build project does not exist yet.
    #[error("build project not found: {project}")]
    ProjectNotFound { project: String },

    /// The remote API throttled the request.
    #[error("request throttled: {0}")]
    Throttled(String),

    /// The remote build finished unsuccessfully.
    #[error("build failed: {description}")]
    BuildFailed { description: String },

    /// The build was canceled or timed out before completing.
    #[error("build canceled: {0}")]
    Canceled(#[source] ContextError),

    /// The builder is draining and no longer accepts builds.
    #[error("builder is shutting down")]
    ShuttingDown,

    /// Reading from or writing to a log stream failed.
    #[error("log transport error: {0}")]
    LogTransport(String),

    /// Commit status reporting failed.
    #[error("status error: {0}")]
    Status(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// The build queue has been closed.
    #[error("build queue closed")]
    QueueClosed,

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad repository name, malformed payload, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ConveyorError>;

impl ConveyorError {
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

    /// Create a build failure carrying the remote description.
    pub fn build_failed(description: impl Into<String>) -> Self {
        Self::BuildFailed {
            description: description.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The context error behind a cancellation, if this is one.
    pub fn cancel_reason(&self) -> Option<ContextError> {
        match self {
            Self::Canceled(reason) => Some(*reason),
            _ => None,
        }
    }

    /// Whether the build ended because it was canceled, timed out, or rejected
    /// during shutdown rather than because the build itself failed.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Canceled(_) | Self::ShuttingDown)
    }
}
