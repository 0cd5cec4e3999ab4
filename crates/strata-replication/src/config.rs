//! Ingestion configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::geometry::{DEFAULT_COORDINATE_PRECISION, MAX_COORDINATE_PRECISION};
use strata_core::replica::Dataset;
use strata_core::retry::RetryPolicy;

use crate::error::{ReplicationError, Result};

/// Default upstream for the live replication feed.
pub const DEFAULT_REPLICATION_URL: &str = "https://planet.openstreetmap.org/replication";

/// Default upstream for archived datasets.
pub const DEFAULT_ARCHIVE_URL: &str = "https://planet.openstreetmap.org/replication";

/// Name of the cursor document inside the data directory.
pub const STATE_FILE_NAME: &str = "state.json";

/// Name of the scratch directory inside the data directory.
pub const SCRATCH_DIR_NAME: &str = "scratch";

/// Smallest accepted query memory pool.
pub const MIN_QUERY_MEMORY_LIMIT: usize = 4 * 1024 * 1024;

/// Default memory pool of the ranking and bundling queries.
pub const DEFAULT_QUERY_MEMORY_LIMIT: usize = 512 * 1024 * 1024;

/// Memory pool size and spill location of the ranking and bundling queries.
///
/// Sorts that outgrow the pool spill to files under `spill_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBudget {
    /// Bytes the query engine may hold in memory.
    pub memory_limit: usize,
    /// Directory receiving spill files.
    pub spill_dir: PathBuf,
}

/// Configuration of one ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Directory holding the output files.
    pub data_dir: PathBuf,
    /// Cursor document path; `<data_dir>/state.json` when unset.
    pub state_path: Option<PathBuf>,
    /// Base URL of the live feed.
    pub replication_url: String,
    /// Base URL of archived datasets. When set, a fresh cursor starts at the
    /// oldest dataset instead of the live feed.
    pub archive_url: Option<String>,
    /// Decimal digits kept in point coordinates.
    pub coordinate_precision: u32,
    /// Rows buffered by the parser before each flush.
    pub batch_rows: usize,
    /// Wait before polling again for a diff that is not yet published.
    pub not_published_wait: Duration,
    /// Request timeout for state files.
    pub state_timeout: Duration,
    /// Request timeout for diff bodies.
    pub diff_timeout: Duration,
    /// Retry policy wrapped around each iteration.
    pub iteration_retry: RetryPolicy,
    /// Upper bound on state probes while searching a finer resolution.
    pub navigator_max_probes: u32,
    /// Check-in endpoint of the external monitor, if any.
    pub monitor_url: Option<String>,
    /// Memory pool of the ranking and bundling queries, in bytes.
    pub query_memory_limit: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/replication"),
            state_path: None,
            replication_url: DEFAULT_REPLICATION_URL.to_string(),
            archive_url: None,
            coordinate_precision: DEFAULT_COORDINATE_PRECISION,
            batch_rows: 122_880,
            not_published_wait: Duration::from_secs(60),
            state_timeout: Duration::from_secs(20),
            diff_timeout: Duration::from_secs(300),
            iteration_retry: RetryPolicy::default(),
            navigator_max_probes: 4096,
            monitor_url: None,
            query_memory_limit: DEFAULT_QUERY_MEMORY_LIMIT,
        }
    }
}

impl ReplicationConfig {
    /// Creates a configuration writing to `data_dir` and reading the live feed at
    /// `replication_url`.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>, replication_url: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            replication_url: replication_url.into(),
            ..Self::default()
        }
    }

    /// Enables archived datasets served from `archive_url`.
    #[must_use]
    pub fn with_archive(mut self, archive_url: impl Into<String>) -> Self {
        self.archive_url = Some(archive_url.into());
        self
    }

    /// Returns the cursor document path.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(STATE_FILE_NAME))
    }

    /// Returns the scratch directory.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir.join(SCRATCH_DIR_NAME)
    }

    /// Returns the query budget; spill files go to the scratch directory.
    #[must_use]
    pub fn query_budget(&self) -> QueryBudget {
        QueryBudget {
            memory_limit: self.query_memory_limit,
            spill_dir: self.scratch_dir(),
        }
    }

    /// Returns the output directory.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the dataset a fresh cursor starts from.
    #[must_use]
    pub fn bootstrap_dataset(&self) -> Dataset {
        if self.archive_url.is_some() {
            Dataset::OLDEST
        } else {
            Dataset::Replication
        }
    }

    /// Checks the configuration for values the pipeline cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.replication_url.trim().is_empty() {
            return Err(configuration("replication_url must not be empty"));
        }
        if self.archive_url.as_deref().is_some_and(|url| url.trim().is_empty()) {
            return Err(configuration("archive_url must not be empty when set"));
        }
        if self.batch_rows == 0 {
            return Err(configuration("batch_rows must be positive"));
        }
        if self.coordinate_precision > MAX_COORDINATE_PRECISION {
            return Err(configuration(&format!(
                "coordinate_precision must be at most {MAX_COORDINATE_PRECISION}"
            )));
        }
        if self.query_memory_limit < MIN_QUERY_MEMORY_LIMIT {
            return Err(configuration(&format!(
                "query_memory_limit must be at least {MIN_QUERY_MEMORY_LIMIT} bytes"
            )));
        }
        if self.navigator_max_probes == 0 {
            return Err(configuration("navigator_max_probes must be positive"));
        }
        Ok(())
    }
}

fn configuration(message: &str) -> ReplicationError {
    ReplicationError::Configuration {
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream_cadence() {
        let config = ReplicationConfig::default();
        assert_eq!(config.batch_rows, 122_880);
        assert_eq!(config.coordinate_precision, 7);
        assert_eq!(config.iteration_retry.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.state_path(), PathBuf::from("data/replication/state.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn archive_changes_bootstrap_dataset() {
        let live = ReplicationConfig::new("/tmp/x", "http://feed");
        assert_eq!(live.bootstrap_dataset(), Dataset::Replication);

        let full = live.with_archive("http://archive");
        assert_eq!(full.bootstrap_dataset(), Dataset::CcBySa);
    }

    #[test]
    fn rejects_zero_batch_rows() {
        let config = ReplicationConfig {
            batch_rows: 0,
            ..ReplicationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::Configuration { .. })
        ));
    }

    #[test]
    fn rejects_tiny_query_memory_limit() {
        let config = ReplicationConfig {
            query_memory_limit: 1024,
            ..ReplicationConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReplicationError::Configuration { .. })
        ));
    }

    #[test]
    fn query_budget_spills_to_scratch() {
        let config = ReplicationConfig::new("/srv/strata", "http://feed");
        let budget = config.query_budget();
        assert_eq!(budget.memory_limit, DEFAULT_QUERY_MEMORY_LIMIT);
        assert_eq!(budget.spill_dir, PathBuf::from("/srv/strata/scratch"));
    }

    #[test]
    fn deserializes_partial_document() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{"data_dir": "/srv/strata", "batch_rows": 10}"#).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/strata"));
        assert_eq!(config.batch_rows, 10);
        assert_eq!(config.replication_url, DEFAULT_REPLICATION_URL);
    }
}
