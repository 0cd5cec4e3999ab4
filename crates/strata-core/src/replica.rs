//! Replication feed coordinates and the durable ingestion cursor.
//!
//! A replication feed is addressed by a [`Dataset`] and a [`Resolution`]. Inside
//! a feed, each published diff has a sequence number and a creation timestamp,
//! captured as a [`ReplicaPointer`]. The [`Cursor`] records how far ingestion has
//! progressed and which global sequence id was handed out last.
//!
//! ## Remote Layout
//!
//! ```text
//! {replication_url}/{resolution}/{AAA}/{BBB}/{CCC}.state.txt
//! {replication_url}/{resolution}/{AAA}/{BBB}/{CCC}.osc.gz
//! {archive_url}/{dataset}/{resolution}-replicate/{AAA}/{BBB}/{CCC}.state.txt
//! ```
//!
//! `AAA/BBB/CCC` is the sequence number zero-padded to nine digits; the first
//! segment grows beyond three digits once sequence numbers exceed 999,999,999.
//!
//! ## Local Layout
//!
//! ```text
//! {data_dir}/
//! ├── state.json                         # Cursor
//! ├── replica_{created_at:020}.parquet   # per-diff files
//! ├── bundle_{created_at:020}.parquet    # compacted windows
//! └── scratch/                           # parse output and staged writes
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name prefix of per-diff output files.
pub const REPLICA_FILE_PREFIX: &str = "replica_";

/// File name prefix of compacted bundle files.
pub const BUNDLE_FILE_PREFIX: &str = "bundle_";

/// File extension shared by all columnar output files.
pub const PARQUET_EXTENSION: &str = "parquet";

/// Temporal resolution of a replication feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// One diff per day.
    Day,
    /// One diff per hour.
    Hour,
    /// One diff per minute.
    Minute,
}

impl Resolution {
    /// All resolutions, coarsest first.
    pub const ALL: [Self; 3] = [Self::Day, Self::Hour, Self::Minute];

    /// Returns the lowercase feed name (`day`, `hour`, `minute`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
        }
    }

    /// Returns the time covered by one diff at this resolution.
    #[must_use]
    pub fn period(self) -> TimeDelta {
        match self {
            Self::Day => TimeDelta::days(1),
            Self::Hour => TimeDelta::hours(1),
            Self::Minute => TimeDelta::minutes(1),
        }
    }

    /// Returns the number of diffs merged into a single bundle (one week).
    #[must_use]
    pub const fn merge_window(self) -> u64 {
        match self {
            Self::Day => 7,
            Self::Hour => 7 * 24,
            Self::Minute => 7 * 24 * 60,
        }
    }

    /// Returns the next finer resolution, or `None` at the finest one.
    #[must_use]
    pub const fn finer(self) -> Option<Self> {
        match self {
            Self::Day => Some(Self::Hour),
            Self::Hour => Some(Self::Minute),
            Self::Minute => None,
        }
    }

    /// Returns true for the finest published resolution.
    #[must_use]
    pub const fn is_finest(self) -> bool {
        matches!(self, Self::Minute)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| Error::invalid_name("resolution", s))
    }
}

/// Upstream dataset a feed belongs to.
///
/// History is split across datasets published at different locations. They are
/// consumed oldest first; [`Dataset::Replication`] is the live feed and never ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dataset {
    /// Edits published under the CC-BY-SA license era.
    #[serde(rename = "cc-by-sa")]
    CcBySa,
    /// Edits published during the license change redaction period.
    #[serde(rename = "redaction-period")]
    RedactionPeriod,
    /// The live replication feed.
    #[default]
    #[serde(rename = "replication")]
    Replication,
}

impl Dataset {
    /// The oldest dataset; where a full-history mirror starts.
    pub const OLDEST: Self = Self::CcBySa;

    /// Returns the dataset name as used in remote paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CcBySa => "cc-by-sa",
            Self::RedactionPeriod => "redaction-period",
            Self::Replication => "replication",
        }
    }

    /// Returns the dataset published after this one, if any.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::CcBySa => Some(Self::RedactionPeriod),
            Self::RedactionPeriod => Some(Self::Replication),
            Self::Replication => None,
        }
    }

    /// Returns true for the archived, finite datasets.
    #[must_use]
    pub const fn is_historical(self) -> bool {
        !matches!(self, Self::Replication)
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dataset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        [Self::CcBySa, Self::RedactionPeriod, Self::Replication]
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| Error::invalid_name("dataset", s))
    }
}

/// A single remote feed: one dataset at one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Feed {
    /// Dataset the feed belongs to.
    pub dataset: Dataset,
    /// Temporal resolution of the feed.
    pub resolution: Resolution,
}

impl Feed {
    /// Creates a feed handle.
    #[must_use]
    pub const fn new(dataset: Dataset, resolution: Resolution) -> Self {
        Self {
            dataset,
            resolution,
        }
    }

    /// Returns the feed directory relative to its base URL.
    #[must_use]
    pub fn relative_dir(&self) -> String {
        match self.dataset {
            Dataset::Replication => self.resolution.as_str().to_string(),
            dataset => format!("{dataset}/{}-replicate", self.resolution),
        }
    }

    /// Returns the path of a sequence number relative to the feed base URL,
    /// without file suffix.
    #[must_use]
    pub fn sequence_path(&self, sequence_number: u64) -> String {
        format!("{}/{}", self.relative_dir(), sequence_path(sequence_number))
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dataset, self.resolution)
    }
}

/// Splits a zero-padded sequence number into `AAA/BBB/CCC` path segments.
#[must_use]
pub fn sequence_path(sequence_number: u64) -> String {
    let digits = format!("{sequence_number:09}");
    let split = digits.len() - 6;
    format!(
        "{}/{}/{}",
        &digits[..split],
        &digits[split..split + 3],
        &digits[split + 3..]
    )
}

/// Position of one published diff inside a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaPointer {
    /// Upstream sequence number of the diff.
    pub sequence_number: u64,
    /// Upstream timestamp of the diff.
    pub created_at: DateTime<Utc>,
}

impl ReplicaPointer {
    /// Creates a pointer.
    #[must_use]
    pub const fn new(sequence_number: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            sequence_number,
            created_at,
        }
    }

    /// The pointer a fresh feed starts from: sequence 0 at the Unix epoch.
    #[must_use]
    pub const fn epoch() -> Self {
        Self {
            sequence_number: 0,
            created_at: DateTime::UNIX_EPOCH,
        }
    }

    /// Returns the pointer expected one period after this one.
    #[must_use]
    pub fn successor(&self, resolution: Resolution) -> Self {
        Self {
            sequence_number: self.sequence_number + 1,
            created_at: self.created_at + resolution.period(),
        }
    }

    /// Returns the per-diff output file name.
    #[must_use]
    pub fn replica_file_name(&self) -> String {
        output_file_name(REPLICA_FILE_PREFIX, self.created_at)
    }

    /// Returns the bundle output file name.
    #[must_use]
    pub fn bundle_file_name(&self) -> String {
        output_file_name(BUNDLE_FILE_PREFIX, self.created_at)
    }

    /// Returns the per-diff output path under `data_dir`.
    #[must_use]
    pub fn replica_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.replica_file_name())
    }

    /// Returns the bundle output path under `data_dir`.
    #[must_use]
    pub fn bundle_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.bundle_file_name())
    }
}

// Zero-padded so lexical order equals chronological order.
fn output_file_name(prefix: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{prefix}{:020}.{PARQUET_EXTENSION}",
        created_at.timestamp().max(0)
    )
}

/// Durable ingestion progress.
///
/// `last_sequence_id` never decreases over the cursor lifetime; it is only zero
/// at bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Dataset currently being ingested.
    #[serde(default)]
    pub dataset: Dataset,
    /// Resolution currently being polled.
    #[serde(alias = "frequency")]
    pub resolution: Resolution,
    /// Last diff fully ingested.
    pub last_replica: ReplicaPointer,
    /// Last global sequence id assigned to a row.
    pub last_sequence_id: u64,
}

impl Cursor {
    /// Returns the bootstrap cursor for `dataset`: coarsest resolution, epoch
    /// pointer, no rows assigned.
    #[must_use]
    pub const fn bootstrap(dataset: Dataset) -> Self {
        Self {
            dataset,
            resolution: Resolution::Day,
            last_replica: ReplicaPointer::epoch(),
            last_sequence_id: 0,
        }
    }

    /// Returns the feed the cursor currently reads from.
    #[must_use]
    pub const fn feed(&self) -> Feed {
        Feed::new(self.dataset, self.resolution)
    }

    /// Returns the next diff the cursor expects to ingest.
    #[must_use]
    pub fn next_replica(&self) -> ReplicaPointer {
        self.last_replica.successor(self.resolution)
    }

    /// Returns true when the last ingested diff closes a merge window.
    #[must_use]
    pub const fn closes_merge_window(&self) -> bool {
        self.last_replica.sequence_number % self.resolution.merge_window() == 0
    }
}
