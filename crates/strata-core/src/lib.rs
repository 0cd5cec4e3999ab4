//! # strata-core
//!
//! Shared primitives for the strata replication mirror.
//!
//! strata mirrors an upstream, append-only map edit history published as periodic
//! replication diffs into globally ordered columnar files. This crate holds the
//! pieces every other crate agrees on:
//!
//! - **Feed Coordinates**: resolutions, datasets, replica pointers and the cursor
//! - **Element Identity**: packed typed element ids
//! - **Geometry**: compressible WKB point encoding
//! - **Retry**: a reusable retry-with-backoff wrapper
//! - **Observability**: logging initialisation and span constructors
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let cursor = Cursor::bootstrap(Dataset::Replication);
//! assert_eq!(cursor.resolution, Resolution::Day);
//! assert_eq!(cursor.next_replica().sequence_number, 1);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod element;
pub mod error;
pub mod geometry;
pub mod observability;
pub mod replica;
pub mod retry;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use strata_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, FixedClock, SystemClock};
    pub use crate::element::{ElementType, TypedElementId};
    pub use crate::error::{Error, Result};
    pub use crate::geometry::{POINT_WKB_LEN, PointWkb, point_to_compressible_wkb};
    pub use crate::replica::{Cursor, Dataset, Feed, ReplicaPointer, Resolution};
    pub use crate::retry::{RetryError, RetryPolicy, Retryable, retry};
}

pub use error::{Error, Result};
