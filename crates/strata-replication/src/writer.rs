//! Columnar file writers.
//!
//! [`ScratchWriter`] receives parser batches and writes the unsorted scratch file.
//! [`publish_stream`] drains a query result into a staged file and renames it to
//! its final name, so a reader never sees a half-written output file.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::compute::cast;
use arrow::record_batch::RecordBatch;
use datafusion::physical_plan::SendableRecordBatchStream;
use futures::StreamExt;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;

use crate::change_parser::RowSink;
use crate::error::{ReplicationError, Result};
use crate::parquet_util::{
    ElementChange, changes_to_batch, create_writer, output_schema, scratch_schema,
    scratch_writer_properties,
};

/// Writes parser output to a scratch parquet file.
///
/// The file is only created once the first rows arrive; an empty document leaves
/// nothing behind.
pub struct ScratchWriter {
    path: PathBuf,
    writer: Option<ArrowWriter<File>>,
    rows: u64,
}

impl ScratchWriter {
    /// Creates a writer for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            rows: 0,
        }
    }

    /// Closes the file. Returns its path, or `None` if no rows were written.
    ///
    /// # Errors
    ///
    /// Returns an error if the parquet footer cannot be written.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        let Some(writer) = self.writer else {
            return Ok(None);
        };
        writer
            .close()
            .map_err(|e| ReplicationError::parquet(format!("parquet close failed: {e}")))?;
        tracing::debug!(path = %self.path.display(), rows = self.rows, "scratch file written");
        Ok(Some(self.path))
    }
}

impl RowSink for ScratchWriter {
    fn write_rows(&mut self, rows: &[ElementChange]) -> Result<()> {
        let batch = changes_to_batch(rows)?;
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => create_writer(&self.path, scratch_schema(), scratch_writer_properties())?,
        };
        let writer = self.writer.insert(writer);
        writer
            .write(&batch)
            .map_err(|e| ReplicationError::parquet(format!("parquet write failed: {e}")))?;
        // One row group per parser batch.
        writer
            .flush()
            .map_err(|e| ReplicationError::parquet(format!("parquet flush failed: {e}")))?;
        self.rows += rows.len() as u64;
        Ok(())
    }
}

/// Writes every batch of `stream` to `staging`, then renames it to `target`.
///
/// Batches are conformed to the output schema. Returns the number of rows
/// written; when the stream is empty nothing is written and `target` is untouched.
///
/// # Errors
///
/// Returns an error if the stream fails, a batch does not fit the output schema,
/// or the file cannot be written or renamed.
pub async fn publish_stream(
    mut stream: SendableRecordBatchStream,
    staging: &Path,
    target: &Path,
    props: WriterProperties,
) -> Result<u64> {
    let schema = output_schema();
    let mut writer: Option<ArrowWriter<File>> = None;
    let mut rows: u64 = 0;

    while let Some(batch) = stream.next().await {
        let batch = conform(&batch?)?;
        if batch.num_rows() == 0 {
            continue;
        }
        let active = match writer.take() {
            Some(active) => active,
            None => create_writer(staging, Arc::clone(&schema), props.clone())?,
        };
        let active = writer.insert(active);
        active
            .write(&batch)
            .map_err(|e| ReplicationError::parquet(format!("parquet write failed: {e}")))?;
        rows += batch.num_rows() as u64;
    }

    let Some(writer) = writer else {
        return Ok(0);
    };
    writer
        .close()
        .map_err(|e| ReplicationError::parquet(format!("parquet close failed: {e}")))?;
    fs::rename(staging, target).map_err(|e| ReplicationError::io(target, &e))?;
    Ok(rows)
}

/// Casts query output columns to the output schema types.
fn conform(batch: &RecordBatch) -> Result<RecordBatch> {
    let schema = output_schema();
    if batch.num_columns() != schema.fields().len() {
        return Err(ReplicationError::query(format!(
            "query produced {} columns, expected {}",
            batch.num_columns(),
            schema.fields().len()
        )));
    }

    let columns = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .map(|(field, column)| {
            if column.data_type() == field.data_type() {
                Ok(Arc::clone(column))
            } else {
                cast(column, field.data_type()).map_err(|e| {
                    ReplicationError::query(format!("column '{}' cast failed: {e}", field.name()))
                })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    RecordBatch::try_new(schema, columns)
        .map_err(|e| ReplicationError::query(format!("output batch build failed: {e}")))
}

/// Removes every file in `dir`, creating the directory if needed.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, listed or cleaned.
pub fn reset_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| ReplicationError::io(dir, &e))?;
    for entry in fs::read_dir(dir).map_err(|e| ReplicationError::io(dir, &e))? {
        let path = entry.map_err(|e| ReplicationError::io(dir, &e))?.path();
        if path.is_file() {
            fs::remove_file(&path).map_err(|e| ReplicationError::io(&path, &e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parquet_util::{read_batches, row_count};
    use chrono::{TimeZone, Utc};
    use strata_core::element::{ElementType, TypedElementId};

    fn row(parse_order: u64) -> ElementChange {
        ElementChange {
            parse_order,
            changeset_id: 1,
            typed_id: TypedElementId::new(ElementType::Node, parse_order as i64 + 1).unwrap(),
            version: 1,
            visible: false,
            tags: None,
            point: None,
            members: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            user_id: None,
            display_name: None,
        }
    }

    #[test]
    fn scratch_writer_is_lazy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica_1.parquet");

        let writer = ScratchWriter::new(&path);
        assert_eq!(writer.finish().unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn scratch_writer_writes_one_row_group_per_batch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica_1.parquet");

        let mut writer = ScratchWriter::new(&path);
        writer.write_rows(&[row(0), row(1)]).unwrap();
        writer.write_rows(&[row(2)]).unwrap();
        assert_eq!(writer.finish().unwrap(), Some(path.clone()));

        assert_eq!(row_count(&path).unwrap(), 3);
        assert_eq!(read_batches(&path).unwrap().iter().map(RecordBatch::num_rows).sum::<usize>(), 3);
    }

    #[test]
    fn reset_dir_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("replica_1.parquet"), b"partial").unwrap();

        reset_dir(&scratch).unwrap();
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
        reset_dir(&dir.path().join("fresh")).unwrap();
        assert!(dir.path().join("fresh").is_dir());
    }
}
