//! Error types for the storage layer.
//!
//! Two outcomes that look like failures are deliberately *not* errors here:
//! inserting an already-stored id returns [`InsertOutcome::Duplicate`], and a
//! lookup that finds nothing returns `None`.
//!
//! [`InsertOutcome::Duplicate`]: crate::InsertOutcome::Duplicate

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the store, stats, hydration and cache layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed event or filter, rejected before reaching SQLite.
    #[error("validation error: {0}")]
    Validation(#[from] agora_core::Error),

    /// The operation exceeded its time bound.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller aborted the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Every upstream relay failed for this operation.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// SQLite error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON encoding/decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background worker has shut down.
    #[error("shut down: {0}")]
    Shutdown(&'static str),

    /// A blocking task panicked or was aborted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Soft failures are reported to the immediate caller only and never
    /// affect sibling operations.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Cancelled | Self::UpstreamUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "operation timed out after 1.5s");
    }

    #[test]
    fn test_soft_failures() {
        assert!(Error::Cancelled.is_soft());
        assert!(Error::UpstreamUnavailable("all relays failed".into()).is_soft());
        assert!(!Error::Shutdown("recompute queue").is_soft());
    }

    #[test]
    fn test_from_validation_error() {
        let inner = serde_json::from_str::<agora_core::Filter>("[").unwrap_err();
        let err: Error = agora_core::Error::from(inner).into();
        assert!(matches!(err, Error::Validation(_)));
    }
}
