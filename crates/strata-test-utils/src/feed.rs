//! In-process replication feed over HTTP.
//!
//! Serves state files and diff bodies from memory on `127.0.0.1:0`, laid out the
//! way the upstream server lays them out, so the real HTTP source can be tested
//! end to end. Failures can be injected per request.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use strata_core::replica::{Feed, ReplicaPointer};
use tokio::sync::oneshot;

/// Suffix of a published state file.
pub const STATE_SUFFIX: &str = ".state.txt";

/// Suffix of a published diff body.
pub const DIFF_SUFFIX: &str = ".osc.gz";

#[derive(Default)]
struct FeedState {
    files: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<VecDeque<StatusCode>>,
    requests: Mutex<Vec<String>>,
}

/// Formats a state file the way the upstream writes it, including the comment
/// header and escaped colons.
pub fn state_text(pointer: &ReplicaPointer) -> String {
    let timestamp = pointer
        .created_at
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
        .replace(':', "\\:");
    format!(
        "#{}\nsequenceNumber={}\ntimestamp={timestamp}\n",
        pointer.created_at.to_rfc2822(),
        pointer.sequence_number
    )
}

/// HTTP server publishing replication feeds from memory.
pub struct ReplicationFeedServer {
    state: Arc<FeedState>,
    base_url: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _task: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for ReplicationFeedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationFeedServer")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ReplicationFeedServer {
    /// Starts an empty feed server on an ephemeral local port.
    pub async fn start() -> Self {
        let state = Arc::new(FeedState::default());
        let app = Router::new()
            .fallback(serve_file)
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind feed listener");
        let addr: SocketAddr = listener.local_addr().expect("feed listener addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = server.await;
        });

        Self {
            state,
            base_url: format!("http://{addr}"),
            shutdown_tx: Some(shutdown_tx),
            _task: task,
        }
    }

    /// Returns the server base URL (e.g., `http://127.0.0.1:12345`).
    ///
    /// Serves both the live feed and archived datasets.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Publishes a state file and its gzip-compressed diff body.
    pub fn publish(&self, feed: Feed, pointer: ReplicaPointer, diff: impl Into<Bytes>) {
        self.publish_state(feed, pointer);
        self.put(
            format!("/{}{DIFF_SUFFIX}", feed.sequence_path(pointer.sequence_number)),
            diff.into(),
        );
    }

    /// Publishes only a state file.
    pub fn publish_state(&self, feed: Feed, pointer: ReplicaPointer) {
        self.put(
            format!("/{}{STATE_SUFFIX}", feed.sequence_path(pointer.sequence_number)),
            Bytes::from(state_text(&pointer)),
        );
    }

    /// Publishes arbitrary content at `path` (starting with `/`).
    pub fn put(&self, path: impl Into<String>, body: impl Into<Bytes>) {
        lock(&self.state.files).insert(path.into(), body.into());
    }

    /// Answers the next `count` requests with HTTP `status`, whatever they ask for.
    pub fn fail_next(&self, count: usize, status: u16) {
        let status = StatusCode::from_u16(status).expect("valid HTTP status");
        lock(&self.state.failures).extend(std::iter::repeat_n(status, count));
    }

    /// Returns the paths requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state.requests).clone()
    }

    /// Returns how many requests asked for a path ending in `suffix`.
    pub fn request_count(&self, suffix: &str) -> usize {
        lock(&self.state.requests)
            .iter()
            .filter(|path| path.ends_with(suffix))
            .count()
    }
}

impl Drop for ReplicationFeedServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_file(State(state): State<Arc<FeedState>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    lock(&state.requests).push(path.clone());

    if let Some(status) = lock(&state.failures).pop_front() {
        return status.into_response();
    }

    match lock(&state.files).get(&path).cloned() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
