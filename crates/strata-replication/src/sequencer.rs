//! Global sequence id assignment.
//!
//! Rows of one diff are ranked by `(created_at, parse_order)` and numbered from
//! `last_sequence_id + 1`, so the ids of a diff are a contiguous ascending range
//! that continues the global counter. The file itself is physically ordered by
//! `(typed_id, version)` for scan locality; consumers replaying history must order
//! by `sequence_id`, not by file position.
//!
//! Ranking and sorting run through DataFusion under a fixed memory pool. Sorts
//! that outgrow it spill to the scratch directory instead of holding the whole
//! diff in memory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use datafusion::execution::disk_manager::DiskManagerConfig;
use datafusion::execution::memory_pool::FairSpillPool;
use datafusion::execution::runtime_env::RuntimeEnvBuilder;
use datafusion::prelude::{ParquetReadOptions, SessionConfig, SessionContext};
use strata_core::replica::ReplicaPointer;

use crate::config::QueryBudget;
use crate::error::{ReplicationError, Result};
use crate::parquet_util::replica_writer_properties;
use crate::writer::publish_stream;

const SCRATCH_TABLE: &str = "scratch";

/// Creates a query session bounded by `budget`, reading parquet strings as
/// plain `Utf8`.
///
/// A single partition keeps the merge reservations of concurrent sorts from
/// exhausting a small pool.
pub(crate) fn session(budget: &QueryBudget) -> Result<SessionContext> {
    fs::create_dir_all(&budget.spill_dir)
        .map_err(|e| ReplicationError::io(&budget.spill_dir, &e))?;

    let mut config = SessionConfig::new().with_target_partitions(1);
    let execution = &mut config.options_mut().execution;
    execution.parquet.schema_force_view_types = false;
    execution.sort_spill_reservation_bytes = budget.memory_limit / 16;

    let runtime = RuntimeEnvBuilder::new()
        .with_memory_pool(Arc::new(FairSpillPool::new(budget.memory_limit)))
        .with_disk_manager(DiskManagerConfig::NewSpecified(vec![budget.spill_dir.clone()]))
        .build()?;
    Ok(SessionContext::new_with_config_rt(config, Arc::new(runtime)))
}

fn ranking_sql(last_sequence_id: u64) -> String {
    format!(
        "SELECT \
            arrow_cast({last_sequence_id}, 'UInt64') \
                + arrow_cast(ROW_NUMBER() OVER (ORDER BY created_at, parse_order), 'UInt64') \
                AS sequence_id, \
            changeset_id, typed_id, version, visible, tags, point, members, \
            created_at, user_id, display_name \
         FROM {SCRATCH_TABLE} \
         ORDER BY typed_id, version, sequence_id"
    )
}

/// Assigns sequence ids to the rows of `scratch` and writes the per-diff file for
/// `replica` into `data_dir`, holding at most `budget` in memory.
///
/// The output is staged next to `scratch` and renamed into place; the scratch file
/// is removed afterwards. Returns the number of rows written.
///
/// # Errors
///
/// Returns an error if the query fails or the output cannot be written.
pub async fn assign_and_write(
    scratch: &Path,
    replica: &ReplicaPointer,
    last_sequence_id: u64,
    data_dir: &Path,
    budget: &QueryBudget,
) -> Result<u64> {
    let target = replica.replica_path(data_dir);
    let staging = scratch.with_file_name(format!(".{}.tmp", replica.replica_file_name()));

    let ctx = session(budget)?;
    let scratch_url = scratch
        .to_str()
        .ok_or_else(|| ReplicationError::query(format!("non UTF-8 path {}", scratch.display())))?;
    ctx.register_parquet(SCRATCH_TABLE, scratch_url, ParquetReadOptions::default())
        .await?;

    let stream = ctx
        .sql(&ranking_sql(last_sequence_id))
        .await?
        .execute_stream()
        .await?;
    let rows = publish_stream(stream, &staging, &target, replica_writer_properties()).await?;

    fs::remove_file(scratch).map_err(|e| ReplicationError::io(scratch, &e))?;
    tracing::info!(
        path = %target.display(),
        rows,
        first_sequence_id = last_sequence_id + 1,
        "assigned sequence ids"
    );
    Ok(rows)
}
