//! Error types for the Agora data model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while validating or decoding events and filters.
#[derive(Error, Debug)]
pub enum Error {
    /// Event or filter has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Event timestamp is outside the accepted window.
    #[error("invalid created_at {created_at}: {reason}")]
    InvalidTimestamp {
        /// The claimed creation time.
        created_at: u64,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
