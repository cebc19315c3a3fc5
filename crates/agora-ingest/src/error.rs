//! Error types for relay routing and ingestion.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the relay pool, the firehose and the daemon.
#[derive(Error, Debug)]
pub enum Error {
    /// Store, stats or cache failure.
    #[error(transparent)]
    Store(#[from] agora_store::Error),

    /// Event or filter failed structural validation.
    #[error(transparent)]
    Validation(#[from] agora_core::Error),

    /// Nostr SDK error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Converting between the gateway's event model and the wire model failed.
    #[error("Nostr conversion error: {0}")]
    Conversion(String),

    /// SQLite error in the relay directory or trend tracker.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every relay targeted by one operation failed.
    #[error("all upstream relays failed: {0}")]
    UpstreamUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<Error> for agora_store::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Store(inner) => inner,
            Error::Validation(inner) => agora_store::Error::Validation(inner),
            Error::UpstreamUnavailable(reason) => agora_store::Error::UpstreamUnavailable(reason),
            other => agora_store::Error::UpstreamUnavailable(other.to_string()),
        }
    }
}
