//! The metadata enricher: stamps the run-scoped columns (`version`,
//! `vintage_date`, `quality_flag`) onto every delta row.

use std::sync::Arc;

use arrow::array::{RecordBatch, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema};
use chrono::{DateTime, Utc};
use ingestor_types::row::columns;

/// Adds `version = version_ts`, `vintage_date = run start time`, and
/// `quality_flag = "OK"` (when the normalizer hasn't already produced one)
/// to `delta`. `delta` is expected to carry the transient `key_hash` column;
/// it is preserved untouched so the event writer can drop it right before
/// serialization.
pub fn enrich(delta: &RecordBatch, version_ts: &str, vintage_date: DateTime<Utc>) -> anyhow::Result<RecordBatch> {
    let n = delta.num_rows();
    let mut fields: Vec<Field> = delta.schema().fields().iter().map(|f| (**f).clone()).collect();
    let mut cols = delta.columns().to_vec();

    if delta.column_by_name(columns::VERSION).is_none() {
        fields.push(Field::new(columns::VERSION, DataType::Utf8, false));
        cols.push(Arc::new(StringArray::from(vec![version_ts; n])));
    }

    if delta.column_by_name(columns::VINTAGE_DATE).is_none() {
        fields.push(Field::new(
            columns::VINTAGE_DATE,
            DataType::Timestamp(arrow::datatypes::TimeUnit::Millisecond, Some("UTC".into())),
            false,
        ));
        let millis = vintage_date.timestamp_millis();
        cols.push(Arc::new(
            TimestampMillisecondArray::from(vec![millis; n]).with_timezone("UTC"),
        ));
    }

    if delta.column_by_name(columns::QUALITY_FLAG).is_none() {
        fields.push(Field::new(columns::QUALITY_FLAG, DataType::Utf8, false));
        cols.push(Arc::new(StringArray::from(vec!["OK"; n])));
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), cols)?)
}
