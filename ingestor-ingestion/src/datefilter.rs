//! The date-filter step of the pipeline's data flow (fetch → parse → filter
//! → normalize → ...). Drops rows too recent to be considered settled, per
//! the dataset's configured `lag_days`.

use std::sync::Arc;

use arrow::array::{Array, AsArray, BooleanArray, RecordBatch};
use arrow::compute::filter_record_batch;
use chrono::{DateTime, Utc};
use ingestor_types::row::columns;

/// Keeps rows whose `obs_time` (falling back to `obs_date`) is at least
/// `lag_days` old relative to `now`. Rows missing both columns are kept —
/// lag filtering has nothing to judge them against.
pub fn filter_by_lag(frame: &RecordBatch, lag_days: i64, now: DateTime<Utc>) -> anyhow::Result<RecordBatch> {
    if lag_days <= 0 {
        return Ok(frame.clone());
    }
    let cutoff = now - chrono::Duration::days(lag_days);
    let cutoff_millis = cutoff.timestamp_millis();

    let mut mask = vec![true; frame.num_rows()];
    if let Ok(idx) = frame.schema().index_of(columns::OBS_TIME) {
        let array = frame.column(idx);
        let values = array.as_primitive::<arrow::datatypes::TimestampMillisecondType>();
        for row in 0..frame.num_rows() {
            if !array.is_null(row) {
                mask[row] = values.value(row) <= cutoff_millis;
            }
        }
    } else if let Ok(idx) = frame.schema().index_of(columns::OBS_DATE) {
        let array = frame.column(idx);
        let values = array.as_primitive::<arrow::datatypes::Date32Type>();
        let cutoff_day = (cutoff.date_naive() - chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()).num_days() as i32;
        for row in 0..frame.num_rows() {
            if !array.is_null(row) {
                mask[row] = values.value(row) <= cutoff_day;
            }
        }
    }

    Ok(filter_record_batch(frame, &BooleanArray::from(mask))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Float64Array, TimestampMillisecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use chrono::TimeZone;

    fn frame(millis: &[i64]) -> RecordBatch {
        let n = millis.len();
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                columns::OBS_TIME,
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new(columns::VALUE, DataType::Float64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMillisecondArray::from(millis.to_vec()).with_timezone("UTC")),
                Arc::new(Float64Array::from(vec![1.0; n])),
            ],
        )
        .unwrap()
    }

    #[test]
    fn zero_lag_keeps_everything() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let f = frame(&[now.timestamp_millis()]);
        let filtered = filter_by_lag(&f, 0, now).unwrap();
        assert_eq!(filtered.num_rows(), 1);
    }

    #[test]
    fn drops_rows_newer_than_cutoff() {
        let now = Utc.with_ymd_and_hms(2024, 6, 10, 0, 0, 0).unwrap();
        let old = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap().timestamp_millis();
        let recent = Utc.with_ymd_and_hms(2024, 6, 9, 0, 0, 0).unwrap().timestamp_millis();
        let f = frame(&[old, recent]);
        let filtered = filter_by_lag(&f, 5, now).unwrap();
        assert_eq!(filtered.num_rows(), 1);
        let kept = filtered
            .column_by_name(columns::OBS_TIME)
            .unwrap()
            .as_primitive::<arrow::datatypes::TimestampMillisecondType>();
        assert_eq!(kept.value(0), old);
    }
}
