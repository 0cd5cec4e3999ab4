//! Replication metrics.
//!
//! Counters and histograms for the ingestion loop, recorded through the
//! `metrics` facade. They complement the structured logging already in place.

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Iteration Metrics
// ============================================================================

/// Iterations finished, labelled by outcome.
pub const ITERATIONS_TOTAL: &str = "strata_iterations_total";

/// Iteration duration histogram.
pub const ITERATION_DURATION: &str = "strata_iteration_duration_seconds";

/// Rows written to per-diff files.
pub const ROWS_INGESTED: &str = "strata_rows_ingested_total";

/// Seconds between the last ingested diff and now.
pub const REPLICATION_LAG: &str = "strata_replication_lag_seconds";

/// Last assigned global sequence id.
pub const LAST_SEQUENCE_ID: &str = "strata_last_sequence_id";

// ============================================================================
// Fetch Metrics
// ============================================================================

/// Compressed bytes downloaded.
pub const BYTES_FETCHED: &str = "strata_bytes_fetched_total";

/// Transient failures that were retried.
pub const RETRIES_TOTAL: &str = "strata_retries_total";

/// State probes issued while searching a finer resolution.
pub const NAVIGATOR_PROBES: &str = "strata_navigator_probes_total";

// ============================================================================
// Compaction Metrics
// ============================================================================

/// Bundles written.
pub const BUNDLES_WRITTEN: &str = "strata_bundles_written_total";

/// Per-diff files removed by cleanup.
pub const FILES_CLEANED: &str = "strata_files_cleaned_total";

// ============================================================================
// Metric Registration
// ============================================================================

/// Registers all replication metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(ITERATIONS_TOTAL, "Total ingestion iterations by outcome");
    describe_histogram!(ITERATION_DURATION, "Duration of ingestion iterations in seconds");
    describe_counter!(ROWS_INGESTED, "Total element-change rows written");
    describe_gauge!(REPLICATION_LAG, "Seconds between the last ingested diff and now");
    describe_gauge!(LAST_SEQUENCE_ID, "Last assigned global sequence id");
    describe_counter!(BYTES_FETCHED, "Total compressed diff bytes downloaded");
    describe_counter!(RETRIES_TOTAL, "Total retried transient failures");
    describe_counter!(NAVIGATOR_PROBES, "Total state probes during resolution search");
    describe_counter!(BUNDLES_WRITTEN, "Total bundle files written");
    describe_counter!(FILES_CLEANED, "Total per-diff files removed by cleanup");
}

// ============================================================================
// Recording
// ============================================================================

/// Records a finished iteration.
pub fn record_iteration(resolution: &str, outcome: &str, duration_secs: f64) {
    let labels = [
        ("resolution", resolution.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!(ITERATIONS_TOTAL, &labels).increment(1);
    histogram!(ITERATION_DURATION, &labels).record(duration_secs);
}

/// Records rows written for one diff and the cursor position after it.
#[allow(clippy::cast_precision_loss)]
pub fn record_progress(resolution: &str, rows: u64, last_sequence_id: u64, lag_secs: f64) {
    counter!(ROWS_INGESTED, "resolution" => resolution.to_string()).increment(rows);
    gauge!(LAST_SEQUENCE_ID).set(last_sequence_id as f64);
    gauge!(REPLICATION_LAG).set(lag_secs);
}

/// Records a downloaded diff body.
pub fn record_bytes_fetched(resolution: &str, bytes: u64) {
    counter!(BYTES_FETCHED, "resolution" => resolution.to_string()).increment(bytes);
}

/// Records a retried failure.
pub fn record_retry(operation: &str) {
    counter!(RETRIES_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Records one navigation probe.
pub fn record_navigator_probe(resolution: &str) {
    counter!(NAVIGATOR_PROBES, "resolution" => resolution.to_string()).increment(1);
}

/// Records a written bundle.
pub fn record_bundle(resolution: &str) {
    counter!(BUNDLES_WRITTEN, "resolution" => resolution.to_string()).increment(1);
}

/// Records files removed by cleanup.
pub fn record_files_cleaned(count: u64) {
    counter!(FILES_CLEANED).increment(count);
}

/// Timer for iteration duration.
pub struct IterationTimer {
    start: Instant,
    resolution: String,
}

impl IterationTimer {
    /// Starts a timer for an iteration at `resolution`.
    #[must_use]
    pub fn start(resolution: &str) -> Self {
        Self {
            start: Instant::now(),
            resolution: resolution.to_string(),
        }
    }

    /// Finishes the timer and records the outcome.
    pub fn finish(self, outcome: &str) {
        record_iteration(&self.resolution, outcome, self.start.elapsed().as_secs_f64());
    }
}
