//! Error types for the sitesync event model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while interpreting events and addresses.
#[derive(Error, Debug)]
pub enum Error {
    /// A site or event address is neither a `kind:pubkey:identifier`
    /// coordinate nor an `naddr`.
    #[error("invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The string that failed to parse.
        input: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// Event has an invalid field format (e.g., wrong hex length).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// An event is missing a tag required for its kind.
    #[error("event {id} (kind {kind}) is missing required '{tag}' tag")]
    MissingTag {
        /// Hex id of the offending event.
        id: String,
        /// Event kind.
        kind: u16,
        /// Tag name that was expected.
        tag: &'static str,
    },
}
