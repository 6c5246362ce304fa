//! The event writer: partitions the enriched delta by `(year, month)`,
//! writes one Parquet object per non-empty partition, and updates the
//! per-month event index — with rollback of every acknowledged write if any
//! step fails.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{Array, AsArray, RecordBatch};
use arrow::compute::filter_record_batch;
use chrono::{Datelike, Utc};
use ingestor_store::BlobStore;
use ingestor_types::row::columns;
use tracing::{debug, warn};

/// The result of a successful [`write_events`] call.
#[derive(Debug, Default)]
pub struct EventWriteResult {
    /// Keys of every partition object written by this call, in write order.
    pub written: Vec<String>,
    /// Distinct `(year, month)` groups touched, in write order.
    pub affected_months: Vec<(i32, u32)>,
}

/// `(year, month)` when the row carries a date, `None` for the boundary case
/// of a source with no date column.
type MonthKey = Option<(i32, u32)>;

fn month_key_of(batch: &RecordBatch, row: usize) -> anyhow::Result<MonthKey> {
    if let Ok(idx) = batch.schema().index_of(columns::OBS_TIME) {
        let array = batch.column(idx);
        if !array.is_null(row) {
            let millis = array
                .as_primitive::<arrow::datatypes::TimestampMillisecondType>()
                .value(row);
            let dt = chrono::DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| anyhow::anyhow!("obs_time out of range at row {row}"))?;
            return Ok(Some((dt.year(), dt.month())));
        }
    }
    if let Ok(idx) = batch.schema().index_of(columns::OBS_DATE) {
        let array = batch.column(idx);
        if !array.is_null(row) {
            let days = array.as_primitive::<arrow::datatypes::Date32Type>().value(row);
            let date = chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() + chrono::Days::new(days as u64);
            return Ok(Some((date.year(), date.month())));
        }
    }
    Ok(None)
}

/// Groups `batch` by `(year, month)`, preserving first-seen group order.
fn group_by_month(batch: &RecordBatch) -> anyhow::Result<Vec<(MonthKey, RecordBatch)>> {
    let mut order: Vec<MonthKey> = Vec::new();
    let mut masks: BTreeMap<MonthKey, Vec<bool>> = BTreeMap::new();
    for row in 0..batch.num_rows() {
        let key = month_key_of(batch, row)?;
        if !masks.contains_key(&key) {
            order.push(key);
        }
        masks.entry(key).or_insert_with(|| vec![false; batch.num_rows()])[row] = true;
    }
    let mut groups = Vec::with_capacity(order.len());
    for key in order {
        let mask = arrow::array::BooleanArray::from(masks.remove(&key).unwrap());
        let filtered = filter_record_batch(batch, &mask)?;
        groups.push((key, filtered));
    }
    Ok(groups)
}

/// Drops the transient `key_hash` column before serialization; it is never
/// part of the payload written to storage.
fn without_key_hash(batch: &RecordBatch) -> anyhow::Result<RecordBatch> {
    let schema = batch.schema();
    let keep: Vec<usize> = (0..schema.fields().len())
        .filter(|&i| schema.field(i).name() != columns::KEY_HASH)
        .collect();
    Ok(batch.project(&keep)?)
}

async fn rollback(store: &BlobStore, dataset_id: &str, version_ts: &str, written: &[String], indexed_months: &[(i32, u32)]) {
    for key in written {
        if let Err(e) = store.delete_object(key).await {
            warn!(key, error = %e, "rollback: failed to delete partially written event; continuing best-effort");
        }
    }
    let now = Utc::now().to_rfc3339();
    for &(year, month) in indexed_months {
        if let Err(e) = ingestor_store::event_index::remove_version(store, dataset_id, year, month, version_ts, &now).await {
            warn!(
                dataset_id, year, month, version_ts, error = %e,
                "rollback: failed to remove event-index entry; continuing best-effort"
            );
        }
    }
}

/// Writes one Parquet partition per non-empty `(year, month)` group in
/// `enriched_delta`, then updates the per-month event index. Rolls back
/// every partition acknowledged by this call if any step fails.
#[tracing::instrument(skip(store, enriched_delta), fields(rows = enriched_delta.num_rows()))]
pub async fn write_events(
    store: &BlobStore,
    dataset_id: &str,
    version_ts: &str,
    enriched_delta: &RecordBatch,
) -> anyhow::Result<EventWriteResult> {
    let mut result = EventWriteResult::default();
    let mut indexed_months: Vec<(i32, u32)> = Vec::new();

    let outcome: anyhow::Result<()> = async {
        let groups = group_by_month(enriched_delta)?;
        for (key, group) in groups {
            if group.num_rows() == 0 {
                continue;
            }
            let payload = without_key_hash(&group)?;
            let object_key = match key {
                Some((year, month)) => ingestor_store::paths::event_partition_key(dataset_id, version_ts, year, month),
                None => ingestor_store::paths::event_unpartitioned_key(dataset_id, version_ts),
            };
            store.put_parquet(&object_key, &payload).await?;
            debug!(object_key, rows = payload.num_rows(), "wrote event partition");
            result.written.push(object_key);
            if let Some((year, month)) = key {
                result.affected_months.push((year, month));
            }
        }

        for &(year, month) in &result.affected_months.clone() {
            update_event_index(store, dataset_id, version_ts, year, month).await?;
            indexed_months.push((year, month));
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => Ok(result),
        Err(e) => {
            rollback(store, dataset_id, version_ts, &result.written, &indexed_months).await;
            Err(e)
        }
    }
}

async fn update_event_index(
    store: &BlobStore,
    dataset_id: &str,
    version_ts: &str,
    year: i32,
    month: u32,
) -> anyhow::Result<()> {
    let now = Utc::now().to_rfc3339();
    ingestor_store::event_index::upsert_version(store, dataset_id, year, month, version_ts, &now).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Date32Array, Float64Array, StringArray, TimestampMillisecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use chrono::TimeZone;
    use object_store::memory::InMemory;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()))
    }

    fn batch(dates: &[(i32, u32)]) -> RecordBatch {
        let n = dates.len();
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                columns::OBS_TIME,
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new(columns::OBS_DATE, DataType::Date32, false),
            Field::new(columns::VALUE, DataType::Float64, false),
            Field::new(columns::INTERNAL_SERIES_CODE, DataType::Utf8, false),
            Field::new(columns::KEY_HASH, DataType::Utf8, false),
        ]));
        let millis: Vec<i64> = dates
            .iter()
            .map(|&(y, m)| Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).unwrap().timestamp_millis())
            .collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMillisecondArray::from(millis).with_timezone("UTC")),
                Arc::new(Date32Array::from(vec![0; n])),
                Arc::new(Float64Array::from(vec![1.0; n])),
                Arc::new(StringArray::from((0..n).map(|i| format!("s{i}")).collect::<Vec<_>>())),
                Arc::new(StringArray::from((0..n).map(|i| format!("h{i}")).collect::<Vec<_>>())),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn writes_one_partition_per_month() {
        let store = store();
        let b = batch(&[(2024, 1), (2024, 2), (2024, 1)]);
        let result = write_events(&store, "cpi", "2024-01-01T00-00-00", &b).await.unwrap();
        assert_eq!(result.written.len(), 2);
        assert_eq!(result.affected_months.len(), 2);
    }

    #[tokio::test]
    async fn written_payload_excludes_key_hash() {
        let store = store();
        let b = batch(&[(2024, 1)]);
        let result = write_events(&store, "cpi", "2024-01-01T00-00-00", &b).await.unwrap();
        let key = &result.written[0];
        let batches = store.get_parquet(key).await.unwrap().unwrap();
        assert!(batches[0].column_by_name(columns::KEY_HASH).is_none());
    }

    #[tokio::test]
    async fn updates_event_index_for_each_affected_month() {
        let store = store();
        let b = batch(&[(2024, 1)]);
        write_events(&store, "cpi", "2024-01-01T00-00-00", &b).await.unwrap();
        let record = ingestor_store::event_index::read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(record.versions, vec!["2024-01-01T00-00-00"]);
        assert_eq!(record.event_count, 1);
    }

    #[tokio::test]
    async fn second_version_appends_to_existing_index() {
        let store = store();
        write_events(&store, "cpi", "v1", &batch(&[(2024, 1)])).await.unwrap();
        write_events(&store, "cpi", "v2", &batch(&[(2024, 1)])).await.unwrap();
        let record = ingestor_store::event_index::read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(record.versions, vec!["v1", "v2"]);
    }

    /// Simulates the failure window spec §4.F guards against: the index was
    /// already upserted for one affected month when a later step fails.
    /// Rollback must erase that entry, not just the written partitions.
    #[tokio::test]
    async fn rollback_removes_index_entries_it_added() {
        let store = store();
        // v1 already indexed january in an earlier, successful run.
        write_events(&store, "cpi", "v1", &batch(&[(2024, 1)])).await.unwrap();
        // Simulate v2 having indexed both january and february before a
        // later step (e.g. the pointer CAS) failed.
        let now = "2024-02-01T00:00:00Z";
        ingestor_store::event_index::upsert_version(&store, "cpi", 2024, 1, "v2", now).await.unwrap();
        ingestor_store::event_index::upsert_version(&store, "cpi", 2024, 2, "v2", now).await.unwrap();

        rollback(&store, "cpi", "v2", &[], &[(2024, 1), (2024, 2)]).await;

        let jan = ingestor_store::event_index::read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(jan.versions, vec!["v1"], "v1 predates the rolled-back run and must survive");
        let feb = ingestor_store::event_index::read(&store, "cpi", 2024, 2).await.unwrap().unwrap();
        assert!(feb.versions.is_empty(), "february had only v2's entry, which rollback must remove");
    }
}
