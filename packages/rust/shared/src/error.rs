//! Error types for plancrawl.
//!
//! Library crates use [`PlanCrawlError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all plancrawl operations.
#[derive(Debug, thiserror::Error)]
pub enum PlanCrawlError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the catalog site.
    #[error("network error: {0}")]
    Network(String),

    /// HTML, JSON or CSV parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// A save attempt failed. Logged and retried on the next cycle.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// No usable state could be loaded while prior artifacts exist.
    #[error("recovery error: {message}")]
    Recovery { message: String },

    /// A navigation/extraction collaborator reported a failure.
    #[error("collaborator error: {0}")]
    Collaborator(String),

    /// A task attempt exceeded its wall-clock budget.
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown key, broken invariant, bad input).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PlanCrawlError>;

impl PlanCrawlError {
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

    /// Create a persistence error from any displayable message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Create a recovery error from any displayable message.
    pub fn recovery(msg: impl Into<String>) -> Self {
        Self::Recovery {
            message: msg.into(),
        }
    }

    /// Create a collaborator error from any displayable message.
    pub fn collaborator(msg: impl Into<String>) -> Self {
        Self::Collaborator(msg.into())
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

    /// Whether this error is the fatal, operator-facing recovery failure.
    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::Recovery { .. })
    }
}
