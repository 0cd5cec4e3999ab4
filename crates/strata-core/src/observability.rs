//! Observability infrastructure for strata.
//!
//! Structured logging through `tracing`, initialised once per process, and span
//! constructors carrying the diagnostic fields every ingestion iteration reports.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::replica::{Cursor, Feed, ReplicaPointer};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `strata_replication=debug`)
///
/// # Example
///
/// ```rust
/// use strata_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates the span one ingestion iteration runs in.
///
/// # Example
///
/// ```rust
/// use strata_core::observability::iteration_span;
/// use strata_core::replica::{Cursor, Dataset};
///
/// let cursor = Cursor::bootstrap(Dataset::Replication);
/// let span = iteration_span(&cursor);
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn iteration_span(cursor: &Cursor) -> Span {
    tracing::info_span!(
        "iteration",
        dataset = %cursor.dataset,
        resolution = %cursor.resolution,
        sequence_number = cursor.last_replica.sequence_number,
        last_sequence_id = cursor.last_sequence_id,
    )
}

/// Creates a span for a single remote request.
#[must_use]
pub fn fetch_span(operation: &str, feed: Feed, sequence_number: u64) -> Span {
    tracing::debug_span!(
        "fetch",
        op = operation,
        feed = %feed,
        sequence_number = sequence_number,
    )
}

/// Creates a span for writing one output file.
#[must_use]
pub fn write_span(kind: &str, pointer: &ReplicaPointer) -> Span {
    tracing::info_span!(
        "write",
        kind = kind,
        sequence_number = pointer.sequence_number,
        created_at = %pointer.created_at,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{Dataset, Resolution};

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json); // Second call should be no-op
    }

    #[test]
    fn test_iteration_span_creates_span() {
        let cursor = Cursor::bootstrap(Dataset::Replication);
        let span = iteration_span(&cursor);
        let _guard = span.enter();
        tracing::info!("iteration message");
    }

    #[test]
    fn test_fetch_and_write_spans() {
        let feed = Feed::new(Dataset::Replication, Resolution::Minute);
        let _fetch = fetch_span("state", feed, 42).entered();
        let _write = write_span("replica", &ReplicaPointer::epoch()).entered();
        tracing::info!("nested spans");
    }
}
