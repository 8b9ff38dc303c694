//! Error types for Pedia.
//!
//! Library crates use [`PediaError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Pedia operations.
#[derive(Debug, thiserror::Error)]
pub enum PediaError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the LLM or search provider.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed provider output or job payload.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Article generation error (provider refused, empty output, etc.).
    #[error("generation error: {0}")]
    Generation(String),

    /// Job queue error (enqueue, claim, or bookkeeping).
    #[error("queue error: {0}")]
    Queue(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PediaError>;

impl PediaError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
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
}
