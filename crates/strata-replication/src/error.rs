//! Error types for replication ingestion.
//!
//! Errors fall into two classes, exposed through [`Retryable`]:
//!
//! - **Transient**: network failures, timeouts, HTTP 5xx/429 and upstream diffs
//!   that are not published yet. Retrying may succeed.
//! - **Fatal**: malformed documents, unknown element kinds, a resolution search
//!   that cannot converge, a corrupt cursor file or local I/O failures. Retrying
//!   cannot fix a logic or data problem, so these propagate immediately.

use std::path::PathBuf;

use strata_core::replica::Feed;
use strata_core::retry::{RetryError, Retryable};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while ingesting a replication feed.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// The request did not complete (connect, read or timeout failure).
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Requested URL.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// The upstream answered with an unexpected HTTP status.
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },

    /// A diff the cursor expects is not available upstream.
    #[error("{feed} sequence {sequence_number} is not published")]
    NotPublished {
        /// Feed that was queried.
        feed: Feed,
        /// Missing sequence number.
        sequence_number: u64,
    },

    /// A state file could not be parsed.
    #[error("malformed state file: {message}")]
    MalformedState {
        /// Description of the problem.
        message: String,
    },

    /// A change document could not be parsed.
    #[error("malformed change document: {message}")]
    MalformedDocument {
        /// Description of the problem.
        message: String,
    },

    /// A shared primitive rejected its input (element kind, id range).
    #[error(transparent)]
    Core(#[from] strata_core::Error),

    /// The search for an equivalent position at a finer resolution failed.
    #[error("no {feed} replica found near {target}: {message}")]
    NavigationFailed {
        /// Finer feed that was searched.
        feed: Feed,
        /// Timestamp being searched for.
        target: chrono::DateTime<chrono::Utc>,
        /// Why the search stopped.
        message: String,
    },

    /// The persisted cursor exists but cannot be decoded.
    #[error("corrupt cursor state at {path}: {message}")]
    CorruptState {
        /// Path of the state document.
        path: PathBuf,
        /// Description of the problem.
        message: String,
    },

    /// Local filesystem operation failed.
    #[error("io error on {path}: {message}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },

    /// Parquet or Arrow encoding failed.
    #[error("parquet error: {message}")]
    Parquet {
        /// Description of the failure.
        message: String,
    },

    /// The ranking or bundling query failed.
    #[error("query error: {message}")]
    Query {
        /// Description of the failure.
        message: String,
    },

    /// A blocking parse task panicked or was cancelled.
    #[error("task failed: {message}")]
    Task {
        /// Description of the failure.
        message: String,
    },

    /// A bundle was requested for a cursor that does not close a merge window.
    #[error("{feed} sequence {sequence_number} does not close a merge window")]
    WindowOpen {
        /// Feed of the cursor.
        feed: Feed,
        /// Last ingested sequence number.
        sequence_number: u64,
    },

    /// Configuration is inconsistent.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A retried operation ran out of time; wraps the last failure.
    #[error("{operation} timed out after {attempts} attempts")]
    RetriesExhausted {
        /// Name of the retried operation.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
        /// The last failure.
        #[source]
        source: Box<ReplicationError>,
    },
}

impl ReplicationError {
    /// Creates an I/O error for `path`.
    pub fn io(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }

    /// Creates a parquet error.
    pub fn parquet(message: impl Into<String>) -> Self {
        Self::Parquet {
            message: message.into(),
        }
    }

    /// Creates a query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
        }
    }

    /// Creates a malformed document error.
    pub fn malformed_document(message: impl Into<String>) -> Self {
        Self::MalformedDocument {
            message: message.into(),
        }
    }
}

impl Retryable for ReplicationError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::NotPublished { .. } => true,
            Self::UnexpectedStatus { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedState { .. }
            | Self::MalformedDocument { .. }
            | Self::Core(_)
            | Self::NavigationFailed { .. }
            | Self::CorruptState { .. }
            | Self::Io { .. }
            | Self::Parquet { .. }
            | Self::Query { .. }
            | Self::Task { .. }
            | Self::WindowOpen { .. }
            | Self::Configuration { .. }
            | Self::RetriesExhausted { .. } => false,
        }
    }
}

impl From<RetryError<ReplicationError>> for ReplicationError {
    fn from(error: RetryError<ReplicationError>) -> Self {
        match error {
            RetryError::Fatal(e) => e,
            RetryError::TimedOut {
                operation,
                attempts,
                source,
            } => Self::RetriesExhausted {
                operation,
                attempts,
                source: Box::new(source),
            },
        }
    }
}

impl From<parquet::errors::ParquetError> for ReplicationError {
    fn from(error: parquet::errors::ParquetError) -> Self {
        Self::parquet(error.to_string())
    }
}

impl From<arrow::error::ArrowError> for ReplicationError {
    fn from(error: arrow::error::ArrowError) -> Self {
        Self::parquet(error.to_string())
    }
}

impl From<datafusion::error::DataFusionError> for ReplicationError {
    fn from(error: datafusion::error::DataFusionError) -> Self {
        Self::query(error.to_string())
    }
}
