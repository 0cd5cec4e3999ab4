//! Remote replication feed access.
//!
//! A [`ReplicationSource`] answers two questions for a feed and sequence number:
//! what does the state file say, and what is the compressed diff body. A 404 is
//! reported as `Ok(None)` so callers can decide from context whether it means
//! "not published yet", "dataset exhausted" or "search went too far".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use strata_core::observability::fetch_span;
use strata_core::replica::{Feed, ReplicaPointer};
use tracing::Instrument;

use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;

/// Suffix of state files.
pub const STATE_SUFFIX: &str = ".state.txt";

/// Suffix of compressed diff bodies.
pub const DIFF_SUFFIX: &str = ".osc.gz";

/// Read access to a replication feed.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Fetches and parses the state file of `sequence_number`.
    ///
    /// Returns `Ok(None)` if the upstream does not have it.
    async fn fetch_state(&self, feed: Feed, sequence_number: u64)
    -> Result<Option<ReplicaPointer>>;

    /// Fetches the gzip-compressed diff body of `sequence_number`.
    ///
    /// Returns `Ok(None)` if the upstream does not have it.
    async fn fetch_diff(&self, feed: Feed, sequence_number: u64) -> Result<Option<Bytes>>;
}

/// Parses a replication state file.
///
/// Lines are `key=value`; empty lines and `#` comments are skipped and backslash
/// escapes are dropped from values. Only `sequenceNumber` and `timestamp` are used.
///
/// # Errors
///
/// Returns [`ReplicationError::MalformedState`] if either key is missing or
/// does not parse.
pub fn parse_state_text(text: &str) -> Result<ReplicaPointer> {
    let mut sequence_number = None;
    let mut timestamp = None;

    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').unwrap_or((line, ""));
        let value = value.trim_end_matches('\r').replace('\\', "");
        match key {
            "sequenceNumber" => sequence_number = Some(value),
            "timestamp" => timestamp = Some(value),
            _ => {}
        }
    }

    let sequence_number = sequence_number
        .ok_or_else(|| malformed_state("missing sequenceNumber"))?
        .parse::<u64>()
        .map_err(|e| malformed_state(format!("invalid sequenceNumber: {e}")))?;
    let timestamp = timestamp.ok_or_else(|| malformed_state("missing timestamp"))?;
    let created_at = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| malformed_state(format!("invalid timestamp {timestamp:?}: {e}")))?
        .with_timezone(&Utc);

    Ok(ReplicaPointer::new(sequence_number, created_at))
}

fn malformed_state(message: impl Into<String>) -> ReplicationError {
    ReplicationError::MalformedState {
        message: message.into(),
    }
}

/// [`ReplicationSource`] over HTTP.
///
/// The live dataset is read from `replication_url`, archived datasets from
/// `archive_url`.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: reqwest::Client,
    replication_url: String,
    archive_url: Option<String>,
    state_timeout: Duration,
    diff_timeout: Duration,
}

impl HttpSource {
    /// Creates a source from the feed URLs and request timeouts in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Configuration`] if the HTTP client cannot be built.
    pub fn new(config: &ReplicationConfig) -> Result<Self> {
        const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("strata/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ReplicationError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            replication_url: config.replication_url.trim_end_matches('/').to_string(),
            archive_url: config
                .archive_url
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_string()),
            state_timeout: config.state_timeout,
            diff_timeout: config.diff_timeout,
        })
    }

    fn url(&self, feed: Feed, sequence_number: u64, suffix: &str) -> Result<String> {
        let base = if feed.dataset.is_historical() {
            self.archive_url
                .as_deref()
                .ok_or_else(|| ReplicationError::Configuration {
                    message: format!("dataset {} requires an archive URL", feed.dataset),
                })?
        } else {
            self.replication_url.as_str()
        };
        Ok(format!("{base}/{}{suffix}", feed.sequence_path(sequence_number)))
    }

    async fn get(&self, url: &str, timeout: Duration) -> Result<Option<Bytes>> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport(url, &e))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(url, "not found upstream");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ReplicationError::UnexpectedStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(|e| transport(url, &e))?;
        Ok(Some(body))
    }
}

fn transport(url: &str, error: &reqwest::Error) -> ReplicationError {
    ReplicationError::Transport {
        url: url.to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl ReplicationSource for HttpSource {
    async fn fetch_state(
        &self,
        feed: Feed,
        sequence_number: u64,
    ) -> Result<Option<ReplicaPointer>> {
        let url = self.url(feed, sequence_number, STATE_SUFFIX)?;
        let body = self
            .get(&url, self.state_timeout)
            .instrument(fetch_span("state", feed, sequence_number))
            .await?;

        body.map(|bytes| {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| malformed_state(format!("state file is not UTF-8: {e}")))?;
            parse_state_text(text)
        })
        .transpose()
    }

    async fn fetch_diff(&self, feed: Feed, sequence_number: u64) -> Result<Option<Bytes>> {
        let url = self.url(feed, sequence_number, DIFF_SUFFIX)?;
        let body = self
            .get(&url, self.diff_timeout)
            .instrument(fetch_span("diff", feed, sequence_number))
            .await?;

        if let Some(bytes) = &body {
            metrics::record_bytes_fetched(feed.resolution.as_str(), bytes.len() as u64);
        }
        Ok(body)
    }
}

/// In-memory [`ReplicationSource`], used for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    published: Arc<RwLock<HashMap<(Feed, u64), Published>>>,
    state_requests: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct Published {
    pointer: ReplicaPointer,
    diff: Option<Bytes>,
}

impl MemorySource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a state file and its diff body.
    pub fn publish(&self, feed: Feed, pointer: ReplicaPointer, diff: impl Into<Bytes>) {
        self.insert(feed, pointer, Some(diff.into()));
    }

    /// Publishes a state file without a diff body.
    pub fn publish_state(&self, feed: Feed, pointer: ReplicaPointer) {
        self.insert(feed, pointer, None);
    }

    /// Returns the number of state files requested so far.
    #[must_use]
    pub fn state_requests(&self) -> u64 {
        self.state_requests.load(Ordering::Relaxed)
    }

    fn insert(&self, feed: Feed, pointer: ReplicaPointer, diff: Option<Bytes>) {
        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((feed, pointer.sequence_number), Published { pointer, diff });
    }

    fn get(&self, feed: Feed, sequence_number: u64) -> Option<Published> {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(feed, sequence_number))
            .cloned()
    }
}

#[async_trait]
impl ReplicationSource for MemorySource {
    async fn fetch_state(
        &self,
        feed: Feed,
        sequence_number: u64,
    ) -> Result<Option<ReplicaPointer>> {
        self.state_requests.fetch_add(1, Ordering::Relaxed);
        Ok(self.get(feed, sequence_number).map(|p| p.pointer))
    }

    async fn fetch_diff(&self, feed: Feed, sequence_number: u64) -> Result<Option<Bytes>> {
        Ok(self.get(feed, sequence_number).and_then(|p| p.diff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::replica::{Dataset, Resolution};

    #[test]
    fn parses_minimal_state_text() {
        let pointer = parse_state_text("sequenceNumber=42\ntimestamp=2024-01-01T00:00:00Z\n").unwrap();
        assert_eq!(pointer.sequence_number, 42);
        assert_eq!(
            pointer.created_at,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn parses_upstream_dialect() {
        let text = "#Sat Jan 06 12:01:02 UTC 2024\n\
                    txnMaxQueried=123\n\
                    sequenceNumber=6123456\n\
                    timestamp=2024-01-06T12\\:00\\:00Z\n";
        let pointer = parse_state_text(text).unwrap();
        assert_eq!(pointer.sequence_number, 6_123_456);
        assert_eq!(
            pointer.created_at,
            Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn missing_keys_are_malformed() {
        let err = parse_state_text("timestamp=2024-01-01T00:00:00Z").unwrap_err();
        assert!(matches!(err, ReplicationError::MalformedState { .. }));
        assert!(parse_state_text("sequenceNumber=x\ntimestamp=2024-01-01T00:00:00Z").is_err());
        assert!(parse_state_text("sequenceNumber=1\ntimestamp=yesterday").is_err());
    }

    #[test]
    fn historical_feed_requires_archive_url() {
        let config = ReplicationConfig::new("/tmp/strata", "http://live/replication/");
        let source = HttpSource::new(&config).unwrap();

        let live = Feed::new(Dataset::Replication, Resolution::Minute);
        assert_eq!(
            source.url(live, 5, STATE_SUFFIX).unwrap(),
            "http://live/replication/minute/000/000/005.state.txt"
        );

        let archived = Feed::new(Dataset::CcBySa, Resolution::Day);
        assert!(matches!(
            source.url(archived, 5, DIFF_SUFFIX),
            Err(ReplicationError::Configuration { .. })
        ));

        let source = HttpSource::new(&config.with_archive("http://archive")).unwrap();
        assert_eq!(
            source.url(archived, 5, DIFF_SUFFIX).unwrap(),
            "http://archive/cc-by-sa/day-replicate/000/000/005.osc.gz"
        );
    }

    #[tokio::test]
    async fn memory_source_reports_missing_entries_as_none() {
        let source = MemorySource::new();
        let feed = Feed::new(Dataset::Replication, Resolution::Hour);
        let pointer = ReplicaPointer::new(3, Utc.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap());
        source.publish_state(feed, pointer);

        assert_eq!(source.fetch_state(feed, 3).await.unwrap(), Some(pointer));
        assert_eq!(source.fetch_state(feed, 4).await.unwrap(), None);
        assert_eq!(source.fetch_diff(feed, 3).await.unwrap(), None);
        assert_eq!(source.state_requests(), 2);
    }
}
