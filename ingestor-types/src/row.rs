//! The normalized row schema, expressed as an Arrow `Schema` so the rest of
//! the pipeline can move `RecordBatch`es straight to Parquet without an
//! intermediate row-oriented representation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::error::TypesError;

/// `source_kind` enum column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Api,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::File => "FILE",
            SourceKind::Api => "API",
        })
    }
}

impl FromStr for SourceKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FILE" => Ok(SourceKind::File),
            "API" => Ok(SourceKind::Api),
            other => Err(TypesError::SchemaMismatch(format!(
                "unknown source_kind {other}"
            ))),
        }
    }
}

/// `quality_flag` enum column. Defaults to `Ok` unless the normalizer marked
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QualityFlag {
    #[default]
    Ok,
    Outlier,
    Imputed,
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QualityFlag::Ok => "OK",
            QualityFlag::Outlier => "OUTLIER",
            QualityFlag::Imputed => "IMPUTED",
        })
    }
}

impl FromStr for QualityFlag {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => Ok(QualityFlag::Ok),
            "OUTLIER" => Ok(QualityFlag::Outlier),
            "IMPUTED" => Ok(QualityFlag::Imputed),
            other => Err(TypesError::SchemaMismatch(format!(
                "unknown quality_flag {other}"
            ))),
        }
    }
}

/// Column name constants, used throughout the pipeline so a typo becomes a
/// compile error rather than a silent schema mismatch.
pub mod columns {
    pub const DATASET_ID: &str = "dataset_id";
    pub const PROVIDER: &str = "provider";
    pub const FREQUENCY: &str = "frequency";
    pub const UNIT: &str = "unit";
    pub const SOURCE_KIND: &str = "source_kind";
    pub const OBS_TIME: &str = "obs_time";
    pub const OBS_DATE: &str = "obs_date";
    pub const VALUE: &str = "value";
    pub const INTERNAL_SERIES_CODE: &str = "internal_series_code";
    pub const VERSION: &str = "version";
    pub const VINTAGE_DATE: &str = "vintage_date";
    pub const QUALITY_FLAG: &str = "quality_flag";
    pub const KEY_HASH: &str = "key_hash";
}

fn timestamp_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
        false,
    )
}

/// The logical row columns, excluding `key_hash` (never persisted in the
/// event payload itself).
pub fn logical_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(columns::DATASET_ID, DataType::Utf8, false),
        Field::new(columns::PROVIDER, DataType::Utf8, false),
        Field::new(columns::FREQUENCY, DataType::Utf8, false),
        Field::new(columns::UNIT, DataType::Utf8, false),
        Field::new(columns::SOURCE_KIND, DataType::Utf8, false),
        timestamp_field(columns::OBS_TIME),
        Field::new(columns::OBS_DATE, DataType::Date32, false),
        Field::new(columns::VALUE, DataType::Float64, false),
        Field::new(columns::INTERNAL_SERIES_CODE, DataType::Utf8, false),
        Field::new(columns::VERSION, DataType::Utf8, false),
        timestamp_field(columns::VINTAGE_DATE),
        Field::new(columns::QUALITY_FLAG, DataType::Utf8, false),
    ]))
}

/// The columns a normalizer is expected to produce, i.e. [`logical_schema`]
/// minus the run-scoped columns the enricher stamps on (`version`,
/// `vintage_date`, `quality_flag`). The delta engine runs against a frame of
/// this shape, before enrichment.
pub fn pre_enrichment_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new(columns::DATASET_ID, DataType::Utf8, false),
        Field::new(columns::PROVIDER, DataType::Utf8, false),
        Field::new(columns::FREQUENCY, DataType::Utf8, false),
        Field::new(columns::UNIT, DataType::Utf8, false),
        Field::new(columns::SOURCE_KIND, DataType::Utf8, false),
        timestamp_field(columns::OBS_TIME),
        Field::new(columns::OBS_DATE, DataType::Date32, false),
        Field::new(columns::VALUE, DataType::Float64, false),
        Field::new(columns::INTERNAL_SERIES_CODE, DataType::Utf8, false),
    ]))
}

/// The logical schema plus the transient `key_hash` column carried on the
/// delta frame until just before event serialization.
pub fn schema_with_key_hash() -> SchemaRef {
    let mut fields: Vec<Field> = logical_schema().fields().iter().map(|f| (**f).clone()).collect();
    fields.push(Field::new(columns::KEY_HASH, DataType::Utf8, false));
    Arc::new(Schema::new(fields))
}

/// The single-column schema of the primary-key index.
pub fn index_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(
        columns::KEY_HASH,
        DataType::Utf8,
        false,
    )]))
}

/// Renders the value of `column` at `row` as the string representation used
/// by the primary-key hash. Supports the column types that can legally
/// appear in `primary_keys`.
pub fn column_value_as_string(
    batch: &arrow::array::RecordBatch,
    column: &str,
    row: usize,
) -> Result<String, TypesError> {
    let idx = batch
        .schema()
        .index_of(column)
        .map_err(|_| TypesError::MissingColumn(column.to_string()))?;
    let array = batch.column(idx);
    if array.is_null(row) {
        return Ok(String::new());
    }
    Ok(match array.data_type() {
        DataType::Utf8 => array.as_string::<i32>().value(row).to_string(),
        DataType::LargeUtf8 => array.as_string::<i64>().value(row).to_string(),
        DataType::Int64 => array.as_primitive::<arrow::datatypes::Int64Type>().value(row).to_string(),
        DataType::Int32 => array.as_primitive::<arrow::datatypes::Int32Type>().value(row).to_string(),
        DataType::Float64 => {
            let v = array.as_primitive::<arrow::datatypes::Float64Type>().value(row);
            format!("{v}")
        }
        DataType::Date32 => array.as_primitive::<arrow::datatypes::Date32Type>().value(row).to_string(),
        DataType::Timestamp(TimeUnit::Millisecond, _) => array
            .as_primitive::<arrow::datatypes::TimestampMillisecondType>()
            .value(row)
            .to_string(),
        DataType::Boolean => array.as_boolean().value(row).to_string(),
        other => {
            return Err(TypesError::SchemaMismatch(format!(
                "unsupported primary-key column type for {column}: {other:?}"
            )))
        }
    })
}
