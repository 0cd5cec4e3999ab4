//! # strata-replication
//!
//! Ingestion of an upstream replication feed into globally ordered columnar files.
//!
//! This crate implements the pipeline, providing:
//!
//! - **Cursor Store**: durable, atomically replaced ingestion position
//! - **Remote Source**: state and diff fetches over HTTP, plus an in-memory source
//! - **Resolution Navigator**: bisection onto the equivalent finer-resolution diff
//! - **Change Parser**: streaming change documents into typed rows
//! - **Sequencer**: gap-free global sequence ids, ranked by event time
//! - **Compactor**: merge-window bundles with deferred cleanup
//! - **Replicator**: the iteration loop tying it all together
//!
//! ## Data Layout
//!
//! ```text
//! {data_dir}/
//! ├── state.json                          # Cursor (temp file + rename)
//! ├── replica_{unix_ts:020}.parquet       # One file per ingested diff
//! ├── bundle_{unix_ts:020}.parquet        # One file per merge window
//! └── scratch/                            # Parse output and staged files
//! ```
//!
//! Per-diff files are sorted by `(typed_id, version)`. Chronological replay must
//! order by `sequence_id`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_replication::prelude::*;
//!
//! let config = ReplicationConfig::new("/var/lib/strata", DEFAULT_REPLICATION_URL);
//! let source = HttpSource::new(&config)?;
//! let replicator = Replicator::new(config, source);
//!
//! let iteration = replicator.run_once().await?;
//! println!("ingested {} rows", iteration.rows);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod change_parser;
pub mod compactor;
pub mod config;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod navigator;
pub mod parquet_util;
pub mod replicator;
pub mod sequencer;
pub mod source;
pub mod state;
pub mod writer;

// Re-export main types at crate root
pub use config::ReplicationConfig;
pub use error::{ReplicationError, Result};
pub use replicator::{Iteration, Replicator};
pub use source::{HttpSource, MemorySource, ReplicationSource};
pub use state::CursorStore;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::change_parser::{ChangeParser, RowSink};
    pub use crate::compactor::BundleResult;
    pub use crate::config::{DEFAULT_REPLICATION_URL, ReplicationConfig};
    pub use crate::error::{ReplicationError, Result};
    pub use crate::monitor::{CheckIn, HttpMonitor, LogMonitor, Monitor};
    pub use crate::replicator::{Iteration, Replicator};
    pub use crate::source::{HttpSource, MemorySource, ReplicationSource};
    pub use crate::state::CursorStore;
}
