//! Bundling of per-diff files.
//!
//! When the last ingested diff closes a merge window, every retained per-diff
//! file is merged into one bundle sorted by `(typed_id, version)` and compressed
//! harder. Bundling never deletes its inputs. Cleanup runs at the start of the
//! *next* iteration against the persisted cursor, so inputs are only removed once
//! a cursor pointing past the bundle is durable.
//!
//! Both steps are idempotent: re-bundling the same inputs rewrites the same file,
//! and cleaning an already clean directory removes nothing. A bundle is only ever
//! written for a cursor that closes a window, so no row lands in two bundles.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use datafusion::prelude::{ParquetReadOptions, col};
use strata_core::replica::{Cursor, PARQUET_EXTENSION, REPLICA_FILE_PREFIX, ReplicaPointer};

use crate::config::{QueryBudget, SCRATCH_DIR_NAME};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::parquet_util::bundle_writer_properties;
use crate::sequencer::session;
use crate::writer::publish_stream;

/// Outcome of a bundle attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleResult {
    /// The bundle file.
    pub path: PathBuf,
    /// Number of per-diff files merged.
    pub inputs: usize,
    /// Number of rows in the bundle.
    pub rows: u64,
}

/// Lists the per-diff files in `data_dir`, oldest first.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn replica_paths(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(data_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(ReplicationError::io(data_dir, &e)),
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ReplicationError::io(data_dir, &e))?.path();
        if is_replica_file(&path) {
            paths.push(path);
        }
    }
    // Names are zero-padded timestamps.
    paths.sort();
    Ok(paths)
}

fn is_replica_file(path: &Path) -> bool {
    path.is_file()
        && path.extension().is_some_and(|ext| ext == PARQUET_EXTENSION)
        && path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(REPLICA_FILE_PREFIX))
}

/// Bundles the retained per-diff files if `cursor` closes a merge window.
///
/// # Errors
///
/// Returns an error if the bundle cannot be written.
pub async fn bundle_if_due(
    cursor: &Cursor,
    data_dir: &Path,
    budget: &QueryBudget,
) -> Result<Option<BundleResult>> {
    if !cursor.closes_merge_window() {
        return Ok(None);
    }
    let result = bundle(&cursor.last_replica, data_dir, budget).await?;
    if result.is_some() {
        metrics::record_bundle(cursor.resolution.as_str());
    }
    Ok(result)
}

/// Rewrites the bundle of the window closed by the persisted `cursor`.
///
/// Used to recover a bundle lost between iterations. Per-diff files are only
/// retained until the iteration after a window closes, so this is only
/// meaningful while `cursor` still sits on that boundary.
///
/// # Errors
///
/// Returns [`ReplicationError::WindowOpen`] if `cursor` does not close a merge
/// window, or an error if the bundle cannot be written.
pub async fn rebundle(
    cursor: &Cursor,
    data_dir: &Path,
    budget: &QueryBudget,
) -> Result<Option<BundleResult>> {
    if !cursor.closes_merge_window() {
        return Err(ReplicationError::WindowOpen {
            feed: cursor.feed(),
            sequence_number: cursor.last_replica.sequence_number,
        });
    }
    bundle_if_due(cursor, data_dir, budget).await
}

/// Merges every retained per-diff file into the bundle named after `pointer`.
///
/// Returns `None` when there is nothing to bundle. An existing bundle of the same
/// name is replaced.
async fn bundle(
    pointer: &ReplicaPointer,
    data_dir: &Path,
    budget: &QueryBudget,
) -> Result<Option<BundleResult>> {
    let inputs = replica_paths(data_dir)?;
    if inputs.is_empty() {
        tracing::debug!(data_dir = %data_dir.display(), "no per-diff files to bundle");
        return Ok(None);
    }

    let urls = inputs
        .iter()
        .map(|path| {
            path.to_str().map(str::to_string).ok_or_else(|| {
                ReplicationError::query(format!("non UTF-8 path {}", path.display()))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let scratch_dir = data_dir.join(SCRATCH_DIR_NAME);
    fs::create_dir_all(&scratch_dir).map_err(|e| ReplicationError::io(&scratch_dir, &e))?;
    let target = pointer.bundle_path(data_dir);
    let staging = scratch_dir.join(format!(".{}.tmp", pointer.bundle_file_name()));

    let stream = session(budget)?
        .read_parquet(urls, ParquetReadOptions::default())
        .await?
        .sort(vec![
            col("typed_id").sort(true, false),
            col("version").sort(true, false),
            col("sequence_id").sort(true, false),
        ])?
        .execute_stream()
        .await?;
    let rows = publish_stream(stream, &staging, &target, bundle_writer_properties()?).await?;

    tracing::info!(
        path = %target.display(),
        inputs = inputs.len(),
        rows,
        "bundle written"
    );
    Ok(Some(BundleResult {
        path: target,
        inputs: inputs.len(),
        rows,
    }))
}

/// Deletes the per-diff files if the persisted `cursor` closes a merge window.
///
/// Must only be called with a cursor loaded from durable state: the bundle for
/// that window was written before the cursor was saved. Returns the number of
/// files removed.
///
/// # Errors
///
/// Returns an error if a file cannot be removed.
pub fn clean_if_due(cursor: &Cursor, data_dir: &Path) -> Result<u64> {
    if !cursor.closes_merge_window() {
        return Ok(0);
    }

    let mut removed = 0;
    for path in replica_paths(data_dir)? {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(ReplicationError::io(&path, &e)),
        }
    }

    if removed > 0 {
        tracing::info!(
            removed,
            sequence_number = cursor.last_replica.sequence_number,
            "cleaned bundled per-diff files"
        );
        metrics::record_files_cleaned(removed);
    }
    Ok(removed)
}
