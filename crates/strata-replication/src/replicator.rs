//! The ingestion loop.
//!
//! One iteration, starting from the persisted cursor:
//!
//! 1. Clean per-diff files bundled by the previous iteration.
//! 2. Under the iteration retry policy: move to a finer resolution if the next
//!    diff lies in the future, fetch its state and body, parse, assign sequence
//!    ids and write the per-diff file.
//! 3. Bundle if the new pointer closes a merge window.
//! 4. Save the new cursor.
//!
//! Nothing outside the data directory changes before step 4, so an interrupted
//! iteration is simply redone from the last saved cursor. The cursor is an
//! explicit value threaded from iteration to iteration; [`Replicator`] holds no
//! ingestion state of its own.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use strata_core::clock::{Clock, SystemClock};
use strata_core::observability::{iteration_span, write_span};
use strata_core::replica::{Cursor, Dataset, Feed, ReplicaPointer, Resolution};
use strata_core::retry::retry;
use tracing::Instrument;

use crate::change_parser::ChangeParser;
use crate::compactor::{self, BundleResult};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics::{self, IterationTimer};
use crate::monitor::{CheckIn, LogMonitor, Monitor};
use crate::navigator;
use crate::sequencer::assign_and_write;
use crate::source::ReplicationSource;
use crate::state::CursorStore;
use crate::writer::{ScratchWriter, reset_dir};

/// Upstream diffs known to be unreadable; they are stepped over without fetching.
const KNOWN_CORRUPTED: &[(Dataset, Resolution, u64)] =
    &[(Dataset::RedactionPeriod, Resolution::Day, 120)];

fn is_known_corrupted(feed: Feed, sequence_number: u64) -> bool {
    KNOWN_CORRUPTED.iter().any(|&(dataset, resolution, seq)| {
        dataset == feed.dataset && resolution == feed.resolution && seq == sequence_number
    })
}

/// Result of one completed iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iteration {
    /// The cursor that was saved.
    pub cursor: Cursor,
    /// Rows ingested from the diff.
    pub rows: u64,
    /// Per-diff files removed at the start of the iteration.
    pub cleaned: u64,
    /// The bundle written at the end of the iteration, if any.
    pub bundle: Option<BundleResult>,
}

#[derive(Debug)]
struct Ingested {
    cursor: Cursor,
    rows: u64,
}

/// Drives a [`ReplicationSource`] into the local data directory.
pub struct Replicator<S> {
    config: ReplicationConfig,
    source: S,
    store: CursorStore,
    parser: ChangeParser,
    clock: Arc<dyn Clock>,
    monitor: Arc<dyn Monitor>,
}

impl<S: ReplicationSource> Replicator<S> {
    /// Creates a replicator reading from `source`, using the system clock and a
    /// logging monitor.
    #[must_use]
    pub fn new(config: ReplicationConfig, source: S) -> Self {
        let store = CursorStore::new(config.state_path(), config.bootstrap_dataset());
        let parser = ChangeParser::new(config.coordinate_precision, config.batch_rows);
        Self {
            config,
            source,
            store,
            parser,
            clock: Arc::new(SystemClock),
            monitor: Arc::new(LogMonitor),
        }
    }

    /// Replaces the clock used to decide resolution escalation.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the check-in monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Returns the cursor store.
    #[must_use]
    pub fn store(&self) -> &CursorStore {
        &self.store
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Loads the persisted cursor and runs one iteration.
    ///
    /// # Errors
    ///
    /// See [`Replicator::step`].
    pub async fn run_once(&self) -> Result<Iteration> {
        let cursor = self.store.load()?;
        self.step(&cursor).await
    }

    /// Runs iterations until one fails, calling `observe` after each.
    ///
    /// # Errors
    ///
    /// Returns the first iteration error. Ingestion resumes from the last saved
    /// cursor on the next start.
    pub async fn run<F>(&self, mut observe: F) -> Result<()>
    where
        F: FnMut(&Iteration) + Send,
    {
        let mut cursor = self.store.load()?;
        tracing::info!(
            dataset = %cursor.dataset,
            resolution = %cursor.resolution,
            sequence_number = cursor.last_replica.sequence_number,
            last_sequence_id = cursor.last_sequence_id,
            "starting replication"
        );
        loop {
            let iteration = self.step(&cursor).await?;
            observe(&iteration);
            cursor = iteration.cursor;
        }
    }

    /// Runs one iteration from `cursor`, which must be the persisted cursor.
    ///
    /// # Errors
    ///
    /// Returns fatal errors immediately and transient errors once the iteration
    /// retry policy is exhausted.
    pub async fn step(&self, cursor: &Cursor) -> Result<Iteration> {
        self.monitor.check_in(CheckIn::InProgress).await;
        let timer = IterationTimer::start(cursor.resolution.as_str());

        let result = self.step_inner(cursor).instrument(iteration_span(cursor)).await;

        match &result {
            Ok(iteration) => {
                timer.finish("ok");
                tracing::info!(
                    dataset = %iteration.cursor.dataset,
                    resolution = %iteration.cursor.resolution,
                    sequence_number = iteration.cursor.last_replica.sequence_number,
                    last_sequence_id = iteration.cursor.last_sequence_id,
                    rows = iteration.rows,
                    "iteration complete"
                );
                self.monitor.check_in(CheckIn::Ok).await;
            }
            Err(error) => {
                timer.finish("error");
                tracing::error!(error = %error, "iteration failed");
                self.monitor.check_in(CheckIn::Error).await;
            }
        }
        result
    }

    async fn step_inner(&self, cursor: &Cursor) -> Result<Iteration> {
        let data_dir = self.config.data_dir();
        let cleaned = compactor::clean_if_due(cursor, data_dir)?;

        let mut attempt: u32 = 0;
        let ingested = retry(&self.config.iteration_retry, "iterate", || {
            attempt += 1;
            if attempt > 1 {
                metrics::record_retry("iterate");
            }
            self.ingest_next(cursor)
        })
        .await?;

        let budget = self.config.query_budget();
        let bundle = compactor::bundle_if_due(&ingested.cursor, data_dir, &budget)
            .instrument(write_span("bundle", &ingested.cursor.last_replica))
            .await?;
        self.store.save(&ingested.cursor)?;

        let lag = self.clock.now() - ingested.cursor.last_replica.created_at;
        #[allow(clippy::cast_precision_loss)]
        let lag_secs = lag.num_milliseconds() as f64 / 1000.0;
        metrics::record_progress(
            ingested.cursor.resolution.as_str(),
            ingested.rows,
            ingested.cursor.last_sequence_id,
            lag_secs,
        );

        Ok(Iteration {
            cursor: ingested.cursor,
            rows: ingested.rows,
            cleaned,
            bundle,
        })
    }

    /// Fetches and writes the diff following `cursor`.
    async fn ingest_next(&self, cursor: &Cursor) -> Result<Ingested> {
        let mut cursor = cursor.clone();

        loop {
            let next = cursor.next_replica();
            let feed = cursor.feed();

            if is_known_corrupted(feed, next.sequence_number) {
                tracing::info!(feed = %feed, sequence_number = next.sequence_number, "skipped known corrupted diff");
                cursor.last_replica = next;
                continue;
            }

            if feed.resolution.is_finest() || next.created_at <= self.clock.now() {
                break;
            }

            let escalated =
                navigator::escalate(&self.source, &cursor, self.config.navigator_max_probes)
                    .await?;
            tracing::info!(
                from = %cursor.resolution,
                to = %escalated.resolution,
                sequence_number = escalated.last_replica.sequence_number,
                "increased replication resolution"
            );
            cursor = escalated;
        }

        let (remote, diff) = loop {
            let next = cursor.next_replica();
            let feed = cursor.feed();

            let Some(remote) = self.source.fetch_state(feed, next.sequence_number).await? else {
                if feed.resolution.is_finest() {
                    self.wait_for_publication(feed, next.sequence_number).await;
                    continue;
                }
                if let Some(dataset) = feed.dataset.next() {
                    tracing::info!(from = %feed.dataset, to = %dataset, "dataset exhausted, switching");
                    cursor.dataset = dataset;
                    cursor.last_replica = ReplicaPointer::epoch();
                    continue;
                }
                return Err(ReplicationError::NotPublished {
                    feed,
                    sequence_number: next.sequence_number,
                });
            };

            if remote.sequence_number != next.sequence_number {
                return Err(ReplicationError::MalformedState {
                    message: format!(
                        "{feed} state for sequence {} reports sequence {}",
                        next.sequence_number, remote.sequence_number
                    ),
                });
            }

            match self.source.fetch_diff(feed, next.sequence_number).await? {
                Some(diff) => break (remote, diff),
                None if feed.resolution.is_finest() => {
                    self.wait_for_publication(feed, next.sequence_number).await;
                }
                None => {
                    return Err(ReplicationError::NotPublished {
                        feed,
                        sequence_number: next.sequence_number,
                    });
                }
            }
        };

        let rows = self
            .write_diff(diff, &remote, cursor.last_sequence_id)
            .instrument(write_span("replica", &remote))
            .await?;

        cursor.last_replica = remote;
        cursor.last_sequence_id += rows;
        Ok(Ingested { cursor, rows })
    }

    async fn wait_for_publication(&self, feed: Feed, sequence_number: u64) {
        tracing::debug!(
            feed = %feed,
            sequence_number,
            wait_secs = self.config.not_published_wait.as_secs(),
            "not yet published, waiting"
        );
        tokio::time::sleep(self.config.not_published_wait).await;
    }

    /// Parses `diff` into a scratch file, then ranks it into the per-diff output.
    async fn write_diff(
        &self,
        diff: Bytes,
        replica: &ReplicaPointer,
        last_sequence_id: u64,
    ) -> Result<u64> {
        let scratch_dir = self.config.scratch_dir();
        let scratch_path = scratch_dir.join(replica.replica_file_name());
        let parser = self.parser;

        let scratch = tokio::task::spawn_blocking(move || -> Result<Option<PathBuf>> {
            // Leftovers of an interrupted iteration.
            reset_dir(&scratch_dir)?;
            let mut writer = ScratchWriter::new(scratch_path);
            let parsed = parser.parse_gzip(&diff, &mut writer)?;
            tracing::debug!(rows = parsed, "parsed change document");
            writer.finish()
        })
        .await
        .map_err(|e| ReplicationError::Task {
            message: format!("parse task failed: {e}"),
        })??;

        let Some(scratch) = scratch else {
            tracing::info!(sequence_number = replica.sequence_number, "skipped empty change document");
            return Ok(0);
        };
        assign_and_write(
            &scratch,
            replica,
            last_sequence_id,
            self.config.data_dir(),
            &self.config.query_budget(),
        )
        .await
    }
}
