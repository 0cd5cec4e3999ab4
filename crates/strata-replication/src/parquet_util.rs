//! Parquet encoding/decoding helpers for element-change files.
//!
//! Two schemas are defined here:
//!
//! - the **scratch** schema, written by the parser, which carries `parse_order`
//!   and no `sequence_id`;
//! - the **output** schema, shared by per-diff files and bundles, which carries
//!   `sequence_id` and no `parse_order`.
//!
//! Output files are read by downstream consumers. Keep schema changes
//! backwards-compatible.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{
    Array as _, ArrayBuilder, BooleanArray, BooleanBuilder, FixedSizeBinaryArray,
    FixedSizeBinaryBuilder, ListArray, ListBuilder, MapArray, MapBuilder, MapFieldNames,
    StringArray, StringBuilder, StructArray, StructBuilder, TimestampMillisecondArray,
    TimestampMillisecondBuilder, UInt64Array, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use parquet::format::{KeyValue, SortingColumn};
use strata_core::element::TypedElementId;
use strata_core::geometry::{POINT_WKB_LEN, PointWkb};

use crate::error::{ReplicationError, Result};

/// Zstandard level used for bundles.
pub const BUNDLE_ZSTD_LEVEL: i32 = 9;

const TIMEZONE: &str = "UTC";

/// One relation or way member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Packed id of the referenced element.
    pub typed_id: TypedElementId,
    /// Member role; always `None` for way node references.
    pub role: Option<String>,
}

/// One parsed element change, before a sequence id is assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementChange {
    /// Position of the element in its change document.
    pub parse_order: u64,
    /// Changeset the edit belongs to.
    pub changeset_id: u64,
    /// Packed element kind and id.
    pub typed_id: TypedElementId,
    /// Element version.
    pub version: u64,
    /// Whether the element has any content after the edit.
    pub visible: bool,
    /// Tags, if the element carries any.
    pub tags: Option<BTreeMap<String, String>>,
    /// Encoded point, for nodes with coordinates.
    pub point: Option<PointWkb>,
    /// Ordered members, for ways and relations that have any.
    pub members: Option<Vec<Member>>,
    /// Edit timestamp.
    pub created_at: DateTime<Utc>,
    /// Editing user id, absent for anonymous edits.
    pub user_id: Option<u64>,
    /// Editing user name, absent for anonymous edits.
    pub display_name: Option<String>,
}

/// One row read back from an output file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChange {
    /// Global sequence id.
    pub sequence_id: u64,
    /// Changeset the edit belongs to.
    pub changeset_id: u64,
    /// Packed element kind and id.
    pub typed_id: TypedElementId,
    /// Element version.
    pub version: u64,
    /// Whether the element has any content after the edit.
    pub visible: bool,
    /// Tags, if any.
    pub tags: Option<BTreeMap<String, String>>,
    /// Encoded point bytes, if any.
    pub point: Option<Vec<u8>>,
    /// Ordered members, if any.
    pub members: Option<Vec<Member>>,
    /// Edit timestamp at millisecond precision.
    pub created_at: DateTime<Utc>,
    /// Editing user id.
    pub user_id: Option<u64>,
    /// Editing user name.
    pub display_name: Option<String>,
}

// ============================================================================
// Schemas
// ============================================================================

fn map_field_names() -> MapFieldNames {
    MapFieldNames {
        entry: "entries".to_string(),
        key: "keys".to_string(),
        value: "values".to_string(),
    }
}

fn tags_type() -> DataType {
    let names = map_field_names();
    let entries = Fields::from(vec![
        Field::new(names.key, DataType::Utf8, false),
        Field::new(names.value, DataType::Utf8, true),
    ]);
    DataType::Map(
        Arc::new(Field::new(names.entry, DataType::Struct(entries), false)),
        false,
    )
}

fn member_fields() -> Fields {
    Fields::from(vec![
        Field::new("typed_id", DataType::UInt64, false),
        Field::new("role", DataType::Utf8, true),
    ])
}

fn member_item_field() -> Arc<Field> {
    Arc::new(Field::new("item", DataType::Struct(member_fields()), true))
}

fn created_at_type() -> DataType {
    DataType::Timestamp(TimeUnit::Millisecond, Some(TIMEZONE.into()))
}

fn change_fields() -> Vec<Field> {
    vec![
        Field::new("changeset_id", DataType::UInt64, false),
        Field::new("typed_id", DataType::UInt64, false),
        Field::new("version", DataType::UInt64, false),
        Field::new("visible", DataType::Boolean, false),
        Field::new("tags", tags_type(), true),
        Field::new(
            "point",
            DataType::FixedSizeBinary(POINT_WKB_LEN as i32),
            true,
        ),
        Field::new("members", DataType::List(member_item_field()), true),
        Field::new("created_at", created_at_type(), false),
        Field::new("user_id", DataType::UInt64, true),
        Field::new("display_name", DataType::Utf8, true),
    ]
}

/// Returns the schema of parser output.
#[must_use]
pub fn scratch_schema() -> SchemaRef {
    let mut fields = vec![Field::new("parse_order", DataType::UInt64, false)];
    fields.extend(change_fields());
    Arc::new(Schema::new(fields))
}

/// Returns the schema of per-diff files and bundles.
#[must_use]
pub fn output_schema() -> SchemaRef {
    let mut fields = vec![Field::new("sequence_id", DataType::UInt64, false)];
    fields.extend(change_fields());
    Arc::new(Schema::new(fields))
}

// ============================================================================
// Writer Properties
// ============================================================================

fn created_by() -> KeyValue {
    KeyValue {
        key: "created_by".to_string(),
        value: Some(concat!("strata-replication ", env!("CARGO_PKG_VERSION")).to_string()),
    }
}

/// Properties for parser scratch files: fast compression, sorted by parse order.
#[must_use]
pub fn scratch_writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::LZ4_RAW)
        .set_statistics_enabled(EnabledStatistics::None)
        .set_sorting_columns(Some(vec![SortingColumn {
            column_idx: 0,
            descending: false,
            nulls_first: false,
        }]))
        .set_key_value_metadata(Some(vec![created_by()]))
        .build()
}

/// Properties for per-diff output files.
#[must_use]
pub fn replica_writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::LZ4_RAW)
        .set_key_value_metadata(Some(vec![created_by()]))
        .build()
}

/// Properties for bundles: slower, denser compression.
///
/// # Errors
///
/// Returns an error if the compression level is rejected.
pub fn bundle_writer_properties() -> Result<WriterProperties> {
    let level = ZstdLevel::try_new(BUNDLE_ZSTD_LEVEL)
        .map_err(|e| ReplicationError::parquet(format!("invalid zstd level: {e}")))?;
    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(level))
        .set_key_value_metadata(Some(vec![created_by()]))
        .build())
}

// ============================================================================
// Encoding
// ============================================================================

/// Builds a scratch record batch from parsed rows.
///
/// # Errors
///
/// Returns an error if a column cannot be built or the batch does not match
/// [`scratch_schema`].
pub fn changes_to_batch(rows: &[ElementChange]) -> Result<RecordBatch> {
    let parse_order = UInt64Array::from_iter_values(rows.iter().map(|r| r.parse_order));
    let changeset_ids = UInt64Array::from_iter_values(rows.iter().map(|r| r.changeset_id));
    let typed_ids = UInt64Array::from_iter_values(rows.iter().map(|r| r.typed_id.as_u64()));
    let versions = UInt64Array::from_iter_values(rows.iter().map(|r| r.version));

    let mut visible = BooleanBuilder::with_capacity(rows.len());
    let mut tags = MapBuilder::new(
        Some(map_field_names()),
        StringBuilder::new(),
        StringBuilder::new(),
    );
    let mut points = FixedSizeBinaryBuilder::with_capacity(rows.len(), POINT_WKB_LEN as i32);
    let mut members = ListBuilder::new(StructBuilder::from_fields(member_fields(), 0))
        .with_field(member_item_field());
    let mut created_at = TimestampMillisecondBuilder::with_capacity(rows.len()).with_timezone(TIMEZONE);
    let mut user_ids = UInt64Builder::with_capacity(rows.len());
    let mut display_names = StringBuilder::new();

    for row in rows {
        visible.append_value(row.visible);

        if let Some(row_tags) = &row.tags {
            for (key, value) in row_tags {
                tags.keys().append_value(key);
                tags.values().append_value(value);
            }
        }
        tags.append(row.tags.is_some())?;

        match &row.point {
            Some(point) => points.append_value(point)?,
            None => points.append_null(),
        }

        if let Some(row_members) = &row.members {
            let entries = members.values();
            for member in row_members {
                member_builder::<UInt64Builder>(entries, 0)?.append_value(member.typed_id.as_u64());
                member_builder::<StringBuilder>(entries, 1)?.append_option(member.role.as_deref());
                entries.append(true);
            }
        }
        members.append(row.members.is_some());

        created_at.append_value(row.created_at.timestamp_millis());
        user_ids.append_option(row.user_id);
        display_names.append_option(row.display_name.as_deref());
    }

    RecordBatch::try_new(
        scratch_schema(),
        vec![
            Arc::new(parse_order),
            Arc::new(changeset_ids),
            Arc::new(typed_ids),
            Arc::new(versions),
            Arc::new(visible.finish()),
            Arc::new(tags.finish()),
            Arc::new(points.finish()),
            Arc::new(members.finish()),
            Arc::new(created_at.finish()),
            Arc::new(user_ids.finish()),
            Arc::new(display_names.finish()),
        ],
    )
    .map_err(|e| ReplicationError::parquet(format!("record batch build failed: {e}")))
}

fn member_builder<T: ArrayBuilder>(entries: &mut StructBuilder, index: usize) -> Result<&mut T> {
    entries
        .field_builder::<T>(index)
        .ok_or_else(|| ReplicationError::parquet(format!("member field {index} has unexpected type")))
}

/// Creates a parquet writer for `path` with `schema` and `props`.
///
/// # Errors
///
/// Returns an error if the file cannot be created or the writer cannot start.
pub fn create_writer(
    path: &Path,
    schema: SchemaRef,
    props: WriterProperties,
) -> Result<ArrowWriter<File>> {
    let file = File::create(path).map_err(|e| ReplicationError::io(path, &e))?;
    ArrowWriter::try_new(file, schema, Some(props))
        .map_err(|e| ReplicationError::parquet(format!("parquet writer init failed: {e}")))
}

// ============================================================================
// Decoding
// ============================================================================

/// Reads every record batch of a parquet file.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or decoded.
pub fn read_batches(path: &Path) -> Result<Vec<RecordBatch>> {
    let file = File::open(path).map_err(|e| ReplicationError::io(path, &e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| ReplicationError::parquet(format!("parquet reader init failed: {e}")))?
        .build()
        .map_err(|e| ReplicationError::parquet(format!("parquet reader build failed: {e}")))?;

    reader
        .map(|batch| {
            batch.map_err(|e| ReplicationError::parquet(format!("parquet read batch failed: {e}")))
        })
        .collect()
}

/// Returns the number of rows in a parquet file from its footer.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or its footer decoded.
pub fn row_count(path: &Path) -> Result<u64> {
    let file = File::open(path).map_err(|e| ReplicationError::io(path, &e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| ReplicationError::parquet(format!("parquet reader init failed: {e}")))?;
    Ok(u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0))
}

/// Reads an output file (per-diff or bundle) into rows, in file order.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not have the output schema.
pub fn read_changes(path: &Path) -> Result<Vec<StoredChange>> {
    let mut rows = Vec::new();
    for batch in read_batches(path)? {
        decode_output_batch(&batch, &mut rows)?;
    }
    Ok(rows)
}

fn decode_output_batch(batch: &RecordBatch, out: &mut Vec<StoredChange>) -> Result<()> {
    let sequence_ids = col::<UInt64Array>(batch, "sequence_id")?;
    let changeset_ids = col::<UInt64Array>(batch, "changeset_id")?;
    let typed_ids = col::<UInt64Array>(batch, "typed_id")?;
    let versions = col::<UInt64Array>(batch, "version")?;
    let visible = col::<BooleanArray>(batch, "visible")?;
    let tags = col::<MapArray>(batch, "tags")?;
    let points = col::<FixedSizeBinaryArray>(batch, "point")?;
    let members = col::<ListArray>(batch, "members")?;
    let created_at = col::<TimestampMillisecondArray>(batch, "created_at")?;
    let user_ids = col::<UInt64Array>(batch, "user_id")?;
    let display_names = col::<StringArray>(batch, "display_name")?;

    for i in 0..batch.num_rows() {
        let millis = created_at.value(i);
        let created_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            ReplicationError::parquet(format!("created_at {millis} is out of range"))
        })?;

        out.push(StoredChange {
            sequence_id: sequence_ids.value(i),
            changeset_id: changeset_ids.value(i),
            typed_id: TypedElementId::from_raw(typed_ids.value(i)),
            version: versions.value(i),
            visible: visible.value(i),
            tags: decode_tags(tags, i)?,
            point: points.is_valid(i).then(|| points.value(i).to_vec()),
            members: decode_members(members, i)?,
            created_at,
            user_id: user_ids.is_valid(i).then(|| user_ids.value(i)),
            display_name: display_names
                .is_valid(i)
                .then(|| display_names.value(i).to_string()),
        });
    }
    Ok(())
}

fn decode_tags(tags: &MapArray, row: usize) -> Result<Option<BTreeMap<String, String>>> {
    if tags.is_null(row) {
        return Ok(None);
    }
    let entries = tags.value(row);
    let keys = downcast::<StringArray>(entries.column(0).as_ref(), "tags.keys")?;
    let values = downcast::<StringArray>(entries.column(1).as_ref(), "tags.values")?;
    Ok(Some(
        (0..entries.len())
            .map(|j| (keys.value(j).to_string(), values.value(j).to_string()))
            .collect(),
    ))
}

fn decode_members(members: &ListArray, row: usize) -> Result<Option<Vec<Member>>> {
    if members.is_null(row) {
        return Ok(None);
    }
    let entries = members.value(row);
    let entries = downcast::<StructArray>(entries.as_ref(), "members")?;
    let typed_ids = downcast::<UInt64Array>(entries.column(0).as_ref(), "members.typed_id")?;
    let roles = downcast::<StringArray>(entries.column(1).as_ref(), "members.role")?;
    Ok(Some(
        (0..entries.len())
            .map(|j| Member {
                typed_id: TypedElementId::from_raw(typed_ids.value(j)),
                role: roles.is_valid(j).then(|| roles.value(j).to_string()),
            })
            .collect(),
    ))
}

fn col<'a, T: 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| ReplicationError::parquet(format!("missing column '{name}': {e}")))?;
    downcast(batch.column(idx).as_ref(), name)
}

fn downcast<'a, T: 'static>(array: &'a dyn arrow::array::Array, name: &str) -> Result<&'a T> {
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        ReplicationError::parquet(format!(
            "column '{name}' has unexpected type {}",
            array.data_type()
        ))
    })
}
