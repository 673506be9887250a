//! Error types for the watch and render pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the watcher, the scheduler, or their collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite store error.
    #[error("Database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Nostr SDK client error.
    #[error("Nostr SDK error: {0}")]
    NostrSdk(#[from] nostr_sdk::client::Error),

    /// Relay connection or query failure.
    #[error("Relay error ({url}): {reason}")]
    Relay { url: String, reason: String },

    /// An operation did not finish within its deadline.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Malformed event, tag or address.
    #[error("Event error: {0}")]
    Event(#[from] sitesync_core::Error),

    /// The render+publish collaborator failed.
    #[error("Render error: {0}")]
    Render(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl Error {
    pub(crate) fn relay(url: &str, reason: impl std::fmt::Display) -> Self {
        Self::Relay {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}
