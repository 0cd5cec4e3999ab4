//! Durable cursor persistence.
//!
//! The cursor is a small JSON document written through a temporary sibling file
//! that is synced and then renamed over the target, so a restart never observes a
//! partially written document.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use strata_core::replica::{Cursor, Dataset};

use crate::error::{ReplicationError, Result};

/// Loads and saves the ingestion [`Cursor`].
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
    bootstrap_dataset: Dataset,
}

impl CursorStore {
    /// Creates a store at `path`. A missing document loads as the bootstrap cursor
    /// of `bootstrap_dataset`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, bootstrap_dataset: Dataset) -> Self {
        Self {
            path: path.into(),
            bootstrap_dataset,
        }
    }

    /// Returns the document path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted cursor, or the bootstrap cursor if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::CorruptState`] if the document cannot be decoded
    /// and [`ReplicationError::Io`] for any read failure other than "not found".
    pub fn load(&self) -> Result<Cursor> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), dataset = %self.bootstrap_dataset, "no cursor found, bootstrapping");
                return Ok(Cursor::bootstrap(self.bootstrap_dataset));
            }
            Err(e) => return Err(ReplicationError::io(&self.path, &e)),
        };

        serde_json::from_slice(&bytes).map_err(|e| ReplicationError::CorruptState {
            path: self.path.clone(),
            message: e.to_string(),
        })
    }

    /// Persists `cursor` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Io`] if the temporary file cannot be written or
    /// renamed into place.
    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(cursor).map_err(|e| ReplicationError::CorruptState {
            path: self.path.clone(),
            message: format!("encode failed: {e}"),
        })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ReplicationError::io(parent, &e))?;
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp).map_err(|e| ReplicationError::io(&tmp, &e))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| ReplicationError::io(&tmp, &e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| ReplicationError::io(&self.path, &e))?;
        tracing::debug!(
            path = %self.path.display(),
            sequence_number = cursor.last_replica.sequence_number,
            last_sequence_id = cursor.last_sequence_id,
            "cursor saved"
        );
        Ok(())
    }

    // `.state.json.tmp` next to `state.json`
    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "state".into(), |n| n.to_string_lossy().into_owned());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}
