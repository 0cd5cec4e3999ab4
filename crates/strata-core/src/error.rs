//! Error types and result aliases for strata.
//!
//! This module defines the shared error types used across all strata components.
//! Errors are structured for programmatic handling and include context for debugging.

/// The result type used throughout strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared strata primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An element identifier does not fit the packed typed-id layout.
    #[error("element id {id} is out of range for a typed element id")]
    ElementIdOutOfRange {
        /// The rejected element id.
        id: i64,
    },

    /// An element kind outside node/way/relation was encountered.
    #[error("unsupported element type {kind:?}")]
    UnsupportedElementType {
        /// The rejected element kind.
        kind: String,
    },

    /// A resolution or dataset name could not be parsed.
    #[error("invalid {what}: {value:?}")]
    InvalidName {
        /// Which kind of name was being parsed.
        what: &'static str,
        /// The rejected value.
        value: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Creates a new invalid name error.
    #[must_use]
    pub fn invalid_name(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidName {
            what,
            value: value.into(),
        }
    }
}
