//! Shared test utilities for strata integration tests.
//!
//! This crate provides:
//! - [`ReplicationFeedServer`]: an in-process HTTP replication feed with failure injection
//! - [`OsmChangeBuilder`] and [`ElementXml`]: change document builders
//! - [`gzip`] and [`state_text`]: upstream file encoders
//!
//! # Example
//!
//! ```rust,ignore
//! use strata_test_utils::{ElementXml, OsmChangeBuilder, ReplicationFeedServer};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let server = ReplicationFeedServer::start().await;
//!     let diff = OsmChangeBuilder::new()
//!         .create(ElementXml::node(1, 1, "2024-01-01T00:00:00Z").coords(0.0, 0.0))
//!         .gzip();
//!     server.publish(feed, pointer, diff);
//!     // ... point an HttpSource at server.base_url() ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod feed;
pub mod osm_change;

pub use feed::*;
pub use osm_change::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("strata=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
