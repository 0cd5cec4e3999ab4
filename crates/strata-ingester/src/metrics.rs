//! Prometheus exposition for the ingester.
//!
//! The pipeline records through the `metrics` facade; this module installs the
//! recorder and serves its rendering on `/metrics`.

use std::sync::OnceLock;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Ingester restarts after an iteration error.
pub const INGESTER_FAILURES_TOTAL: &str = "strata_ingester_failures_total";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes the global metrics recorder with Prometheus exporter.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Panics
///
/// Panics if the Prometheus recorder cannot be installed. The service should not
/// start without metrics.
#[allow(clippy::panic)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .unwrap_or_else(|e| panic!("failed to install prometheus recorder: {e}"));

            describe_counter!(
                INGESTER_FAILURES_TOTAL,
                "Iterations that ended the ingestion loop with an error"
            );
            strata_replication::metrics::register_metrics();

            tracing::info!("Prometheus metrics recorder initialized for ingester");
            handle
        })
        .clone()
}

/// Returns the global Prometheus handle, if initialized.
#[must_use]
pub fn prometheus_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

/// Handler for the `/metrics` endpoint.
pub async fn serve_metrics() -> impl IntoResponse {
    match prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records that the ingestion loop stopped on an error.
pub fn record_failure() {
    counter!(INGESTER_FAILURES_TOTAL).increment(1);
}
