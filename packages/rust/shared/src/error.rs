//! Error types for LeadGarage.
//!
//! Library crates use [`LeadGarageError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Repair failures are not errors: spokes report them as
//! `SpokeResult::failed`, and budget denials are deferrals. This type covers
//! infrastructure faults (config, store, HTTP client setup, I/O).

use std::path::PathBuf;

/// Top-level error type for all LeadGarage operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadGarageError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside a spoke's classified outcome (e.g. client build).
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad import line, malformed field map, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadGarageError>;

impl LeadGarageError {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LeadGarageError::config("duplicate agent 'web_scraper'");
        assert_eq!(err.to_string(), "config error: duplicate agent 'web_scraper'");

        let err = LeadGarageError::validation("line 3: missing record_type");
        assert!(err.to_string().contains("line 3"));

        let err = LeadGarageError::Storage("database is locked".into());
        assert_eq!(err.to_string(), "storage error: database is locked");
    }
}
