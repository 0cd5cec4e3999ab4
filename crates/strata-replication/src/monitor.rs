//! Iteration check-ins for external monitoring.
//!
//! Every iteration reports `in_progress` when it starts and `ok` or `error` when
//! it ends. A cron-style monitor watching these check-ins notices a stalled or
//! crash-looping ingester through missed or failed check-ins. Check-in failures
//! never affect ingestion.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{ReplicationError, Result};

/// Status reported by a check-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckIn {
    /// An iteration started.
    InProgress,
    /// An iteration completed.
    Ok,
    /// An iteration failed.
    Error,
}

impl CheckIn {
    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Receives iteration check-ins.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Reports `status`. Implementations swallow their own failures.
    async fn check_in(&self, status: CheckIn);
}

/// Monitor that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMonitor;

#[async_trait]
impl Monitor for LogMonitor {
    async fn check_in(&self, status: CheckIn) {
        tracing::debug!(status = status.as_str(), "check-in");
    }
}

#[derive(Debug, Serialize)]
struct CheckInRequest {
    status: CheckIn,
}

/// Monitor that posts check-ins as JSON to a URL.
#[derive(Debug, Clone)]
pub struct HttpMonitor {
    client: reqwest::Client,
    url: String,
}

impl HttpMonitor {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Creates a monitor posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Configuration`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ReplicationError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, status: CheckIn) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(&CheckInRequest { status })
            .timeout(Self::REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("status {}", response.status()))
        }
    }
}

#[async_trait]
impl Monitor for HttpMonitor {
    async fn check_in(&self, status: CheckIn) {
        if let Err(error) = self.post(status).await {
            tracing::warn!(url = %self.url, status = status.as_str(), error, "check-in failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_in_serializes_as_snake_case() {
        let body = serde_json::to_string(&CheckInRequest {
            status: CheckIn::InProgress,
        })
        .unwrap();
        assert_eq!(body, r#"{"status":"in_progress"}"#);
        assert_eq!(CheckIn::Error.as_str(), "error");
    }

    #[tokio::test]
    async fn unreachable_monitor_is_ignored() {
        // Port 9 (discard) is not expected to accept connections.
        let monitor = HttpMonitor::new("http://127.0.0.1:9/check-in").unwrap();
        monitor.check_in(CheckIn::Ok).await;
        LogMonitor.check_in(CheckIn::Ok).await;
    }
}
