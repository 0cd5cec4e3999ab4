//! # strata-ingester
//!
//! Long-running replication ingester for strata.
//!
//! Mirrors the upstream replication feed into the local data directory, one diff
//! per iteration, resuming from the persisted cursor on every start.
//!
//! ## Modes
//!
//! - **Service Mode** (`run`): loops forever, optionally with HTTP health endpoints
//! - **CLI Mode** (`once`, `status`, `bundle`): single steps for debugging or recovery
//!
//! ## Health Endpoints
//!
//! - `GET /health` - Shallow liveness check (always 200)
//! - `GET /ready` - Readiness check with ingestion progress
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Usage
//!
//! ```bash
//! # Run as service with health endpoints
//! strata-ingester --data-dir /var/lib/strata run --port 8081
//!
//! # Include the archived datasets
//! strata-ingester --archive-url https://planet.openstreetmap.org/replication run
//!
//! # Inspect or repair
//! strata-ingester status
//! strata-ingester bundle
//! ```
//!
//! Only one ingester may run against a data directory at a time.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod metrics;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use strata_core::observability::{LogFormat, init_logging};
use strata_replication::compactor::{self, BundleResult};
use strata_replication::config::{DEFAULT_QUERY_MEMORY_LIMIT, DEFAULT_REPLICATION_URL};
use strata_replication::monitor::{HttpMonitor, LogMonitor, Monitor};
use strata_replication::parquet_util::row_count;
use strata_replication::{CursorStore, HttpSource, Iteration, ReplicationConfig, Replicator};

// ============================================================================
// CLI Arguments
// ============================================================================

/// strata replication ingester.
#[derive(Debug, Parser)]
#[command(name = "strata-ingester")]
#[command(about = "Mirrors a replication feed into ordered columnar files")]
#[command(version)]
struct Args {
    /// Directory holding the cursor and output files.
    #[arg(long, env = "STRATA_DATA_DIR", global = true, default_value = "data/replication")]
    data_dir: PathBuf,

    /// Cursor document path (default: `<data-dir>/state.json`).
    #[arg(long, env = "STRATA_STATE_PATH", global = true)]
    state_path: Option<PathBuf>,

    /// Base URL of the live replication feed.
    #[arg(long, env = "STRATA_REPLICATION_URL", global = true, default_value = DEFAULT_REPLICATION_URL)]
    replication_url: String,

    /// Base URL of archived datasets; enables ingesting history from the oldest dataset.
    #[arg(long, env = "STRATA_ARCHIVE_URL", global = true)]
    archive_url: Option<String>,

    /// Decimal digits kept when encoding node coordinates.
    #[arg(long, env = "STRATA_COORDINATE_PRECISION", global = true, default_value_t = 7)]
    coordinate_precision: u32,

    /// Rows per parser batch.
    #[arg(long, env = "STRATA_BATCH_ROWS", global = true, default_value_t = 122_880)]
    batch_rows: usize,

    /// Memory available to ranking and bundling queries before they spill (bytes).
    #[arg(long, env = "STRATA_QUERY_MEMORY_LIMIT", global = true, default_value_t = DEFAULT_QUERY_MEMORY_LIMIT)]
    query_memory_limit: usize,

    /// URL receiving iteration check-ins.
    #[arg(long, env = "STRATA_MONITOR_URL", global = true)]
    monitor_url: Option<String>,

    /// Log output format.
    #[arg(long, env = "STRATA_LOG_FORMAT", global = true, value_enum, default_value = "pretty")]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormatArg {
    Json,
    Pretty,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Json => Self::Json,
            LogFormatArg::Pretty => Self::Pretty,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest continuously.
    Run {
        /// HTTP port for health and metrics endpoints; no server when absent.
        #[arg(long, env = "STRATA_PORT")]
        port: Option<u16>,

        /// Maximum time without a successful iteration before unhealthy (seconds).
        #[arg(long, env = "STRATA_UNHEALTHY_THRESHOLD_SECS", default_value = "3600")]
        unhealthy_threshold_secs: u64,
    },

    /// Ingest a single diff.
    Once,

    /// Print the persisted cursor.
    Status,

    /// Rewrite the bundle of the window closed by the current cursor.
    Bundle,
}

impl Args {
    fn replication_config(&self) -> Result<ReplicationConfig> {
        let mut config = ReplicationConfig::new(&self.data_dir, &self.replication_url);
        config.state_path.clone_from(&self.state_path);
        config.archive_url.clone_from(&self.archive_url);
        config.coordinate_precision = self.coordinate_precision;
        config.batch_rows = self.batch_rows;
        config.query_memory_limit = self.query_memory_limit;
        config.monitor_url.clone_from(&self.monitor_url);
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn build_replicator(config: ReplicationConfig) -> Result<Replicator<HttpSource>> {
    let source = HttpSource::new(&config)?;
    let monitor: Arc<dyn Monitor> = match &config.monitor_url {
        Some(url) => Arc::new(HttpMonitor::new(url.clone())?),
        None => Arc::new(LogMonitor),
    };
    Ok(Replicator::new(config, source).with_monitor(monitor))
}

// ============================================================================
// Health State
// ============================================================================

/// Shared state for tracking ingestion health.
#[derive(Debug)]
struct IngesterState {
    /// Whether the ingestion loop has started.
    ready: AtomicBool,
    /// Unix timestamp of the last successful iteration.
    last_success_ts: AtomicU64,
    /// Total successful iterations.
    iterations: AtomicU64,
    /// Upstream sequence number of the last ingested diff.
    sequence_number: AtomicU64,
    /// Last assigned global sequence id.
    last_sequence_id: AtomicU64,
    /// Threshold (seconds) before marking unhealthy.
    unhealthy_threshold_secs: u64,
}

impl IngesterState {
    fn new(unhealthy_threshold_secs: u64) -> Self {
        Self {
            ready: AtomicBool::new(false),
            last_success_ts: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            sequence_number: AtomicU64::new(0),
            last_sequence_id: AtomicU64::new(0),
            unhealthy_threshold_secs,
        }
    }

    fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    fn record_success(&self, iteration: &Iteration, now: DateTime<Utc>) {
        let now: u64 = now.timestamp().try_into().unwrap_or_default();
        self.last_success_ts.store(now, Ordering::Release);
        self.iterations.fetch_add(1, Ordering::Relaxed);
        self.sequence_number
            .store(iteration.cursor.last_replica.sequence_number, Ordering::Relaxed);
        self.last_sequence_id
            .store(iteration.cursor.last_sequence_id, Ordering::Relaxed);
    }

    fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        let last = self.last_success_ts.load(Ordering::Acquire);
        if last == 0 {
            return false;
        }
        let now: u64 = now.timestamp().try_into().unwrap_or_default();
        now.saturating_sub(last) < self.unhealthy_threshold_secs
    }

    fn last_success(&self) -> Option<DateTime<Utc>> {
        let ts = self.last_success_ts.load(Ordering::Acquire);
        if ts == 0 {
            return None;
        }
        DateTime::from_timestamp(i64::try_from(ts).ok()?, 0)
    }
}

// ============================================================================
// Health Endpoints
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
struct ReadyResponse {
    ready: bool,
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_success: Option<String>,
    iterations: u64,
    sequence_number: u64,
    last_sequence_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// GET /health - Shallow liveness check.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /ready - Readiness check with ingestion progress.
async fn ready(State(state): State<Arc<IngesterState>>) -> impl IntoResponse {
    let ready = state.ready.load(Ordering::Acquire);
    let healthy = state.is_healthy(Utc::now());
    let iterations = state.iterations.load(Ordering::Relaxed);

    let message = if !ready {
        Some("Service starting up".to_string())
    } else if iterations == 0 {
        Some("Waiting for first successful iteration".to_string())
    } else if !healthy {
        Some(format!(
            "No successful iteration in {} seconds",
            state.unhealthy_threshold_secs
        ))
    } else {
        None
    };

    let status = if ready && healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            ready,
            healthy,
            last_success: state.last_success().map(|dt| dt.to_rfc3339()),
            iterations,
            sequence_number: state.sequence_number.load(Ordering::Relaxed),
            last_sequence_id: state.last_sequence_id.load(Ordering::Relaxed),
            message,
        }),
    )
}

fn router(state: Arc<IngesterState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics::serve_metrics))
        .with_state(state)
}

// ============================================================================
// Commands
// ============================================================================

async fn run_service(
    config: ReplicationConfig,
    port: Option<u16>,
    unhealthy_threshold_secs: u64,
) -> Result<()> {
    metrics::init_metrics();
    let state = Arc::new(IngesterState::new(unhealthy_threshold_secs));

    if let Some(port) = port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind health server on {addr}"))?;
        tracing::info!(address = %addr, "Starting health server");

        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app).await {
                tracing::error!(error = %error, "health server stopped");
            }
        });
    }

    tracing::info!(
        data_dir = %config.data_dir.display(),
        replication_url = %config.replication_url,
        archive_url = ?config.archive_url,
        "Starting ingester"
    );
    let replicator = build_replicator(config)?;
    state.mark_ready();

    let progress = Arc::clone(&state);
    tokio::select! {
        result = replicator.run(move |iteration| progress.record_success(iteration, Utc::now())) => {
            if let Err(error) = result {
                metrics::record_failure();
                return Err(error).context("ingestion stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown requested; resuming from the last saved cursor on restart");
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    state_path: PathBuf,
    cursor: strata_core::replica::Cursor,
    pending_replicas: usize,
    pending_rows: u64,
}

fn status(config: &ReplicationConfig) -> Result<StatusReport> {
    let store = CursorStore::new(config.state_path(), config.bootstrap_dataset());
    let cursor = store.load()?;
    let pending = compactor::replica_paths(config.data_dir())?;
    let mut pending_rows = 0;
    for path in &pending {
        pending_rows += row_count(path)?;
    }
    Ok(StatusReport {
        state_path: store.path().to_path_buf(),
        cursor,
        pending_replicas: pending.len(),
        pending_rows,
    })
}

/// Rewrites the bundle of the window the persisted cursor closes.
async fn force_bundle(config: &ReplicationConfig) -> Result<Option<BundleResult>> {
    let cursor = status(config)?.cursor;
    let bundle = compactor::rebundle(&cursor, config.data_dir(), &config.query_budget())
        .await
        .context("cannot bundle outside a merge window boundary")?;
    Ok(bundle)
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format.into());
    let config = args.replication_config()?;

    match args.command {
        Commands::Run {
            port,
            unhealthy_threshold_secs,
        } => run_service(config, port, unhealthy_threshold_secs).await?,

        Commands::Once => {
            let iteration = build_replicator(config)?.run_once().await?;
            tracing::info!(
                sequence_number = iteration.cursor.last_replica.sequence_number,
                last_sequence_id = iteration.cursor.last_sequence_id,
                rows = iteration.rows,
                "Iteration complete"
            );
        }

        Commands::Status => {
            let report = status(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Bundle => {
            match force_bundle(&config).await? {
                Some(bundle) => tracing::info!(
                    path = %bundle.path.display(),
                    inputs = bundle.inputs,
                    rows = bundle.rows,
                    "Bundle written"
                ),
                None => tracing::info!("No per-diff files to bundle"),
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use strata_core::replica::{Cursor, Dataset, ReplicaPointer};
    use strata_replication::ReplicationError;

    #[test]
    fn flags_map_onto_config() {
        let args = Args::try_parse_from([
            "strata-ingester",
            "--data-dir",
            "/tmp/strata",
            "--archive-url",
            "http://archive",
            "--batch-rows",
            "10",
            "run",
            "--port",
            "9000",
        ])
        .unwrap();

        let config = args.replication_config().unwrap();
        assert_eq!(config.state_path(), PathBuf::from("/tmp/strata/state.json"));
        assert_eq!(config.archive_url.as_deref(), Some("http://archive"));
        assert_eq!(config.batch_rows, 10);
        assert_eq!(config.bootstrap_dataset(), Dataset::CcBySa);
        assert!(matches!(args.command, Commands::Run { port: Some(9000), .. }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let args =
            Args::try_parse_from(["strata-ingester", "--batch-rows", "0", "once"]).unwrap();
        assert!(args.replication_config().is_err());
    }

    #[test]
    fn health_requires_a_recent_success() {
        let state = IngesterState::new(60);
        let now = Utc::now();
        assert!(!state.is_healthy(now));

        state.mark_ready();
        assert!(!state.is_healthy(now));

        let iteration = Iteration {
            cursor: Cursor {
                last_replica: ReplicaPointer::new(9, now),
                last_sequence_id: 90,
                ..Cursor::bootstrap(Dataset::Replication)
            },
            rows: 5,
            cleaned: 0,
            bundle: None,
        };
        state.record_success(&iteration, now);
        assert!(state.is_healthy(now));
        assert!(!state.is_healthy(now + TimeDelta::seconds(61)));
        assert_eq!(state.last_sequence_id.load(Ordering::Relaxed), 90);
    }

    #[test]
    fn status_reports_bootstrap_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args::try_parse_from([
            "strata-ingester",
            "--data-dir",
            dir.path().to_str().unwrap(),
            "status",
        ])
        .unwrap();

        let report = status(&args.replication_config().unwrap()).unwrap();
        assert_eq!(report.cursor, Cursor::bootstrap(Dataset::Replication));
        assert_eq!(report.pending_replicas, 0);
        assert_eq!(report.pending_rows, 0);
    }

    #[tokio::test]
    async fn bundle_is_refused_mid_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicationConfig::new(dir.path(), "http://unused");
        let mid_window = Cursor {
            last_replica: ReplicaPointer::new(3, Utc::now()),
            last_sequence_id: 6,
            ..Cursor::bootstrap(Dataset::Replication)
        };
        CursorStore::new(config.state_path(), config.bootstrap_dataset())
            .save(&mid_window)
            .unwrap();

        let err = force_bundle(&config).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ReplicationError>(),
            Some(ReplicationError::WindowOpen { sequence_number: 3, .. })
        ));
        assert!(!mid_window.last_replica.bundle_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn bundle_at_window_boundary_without_inputs_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReplicationConfig::new(dir.path(), "http://unused");
        let boundary = Cursor {
            last_replica: ReplicaPointer::new(7, Utc::now()),
            ..Cursor::bootstrap(Dataset::Replication)
        };
        CursorStore::new(config.state_path(), config.bootstrap_dataset())
            .save(&boundary)
            .unwrap();

        assert_eq!(force_bundle(&config).await.unwrap(), None);
    }

    #[test]
    fn query_memory_limit_flag_reaches_config() {
        let args = Args::try_parse_from([
            "strata-ingester",
            "--query-memory-limit",
            "67108864",
            "once",
        ])
        .unwrap();
        assert_eq!(args.replication_config().unwrap().query_memory_limit, 64 << 20);
    }

    #[tokio::test]
    async fn status_counts_rows_awaiting_a_bundle() {
        use strata_core::clock::FixedClock;
        use strata_core::replica::{Feed, Resolution};
        use strata_replication::MemorySource;
        use strata_test_utils::{ElementXml, OsmChangeBuilder};

        let dir = tempfile::tempdir().unwrap();
        let config = ReplicationConfig::new(dir.path(), "memory://");
        let source = MemorySource::new();
        source.publish(
            Feed::new(Dataset::Replication, Resolution::Day),
            ReplicaPointer::new(1, DateTime::UNIX_EPOCH + TimeDelta::days(1)),
            OsmChangeBuilder::new()
                .create(ElementXml::node(1, 1, "1970-01-01T12:00:00Z").coords(1.0, 1.0))
                .create(ElementXml::node(2, 1, "1970-01-01T12:00:00Z").coords(1.0, 1.0))
                .gzip(),
        );
        Replicator::new(config.clone(), source)
            .with_clock(Arc::new(FixedClock(Utc::now())))
            .run_once()
            .await
            .unwrap();

        let report = status(&config).unwrap();
        assert_eq!(report.cursor.last_sequence_id, 2);
        assert_eq!(report.pending_replicas, 1);
        assert_eq!(report.pending_rows, 2);
    }
}
