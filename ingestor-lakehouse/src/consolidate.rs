//! The projection consolidator (spec §4.I): a write-ahead-log-staged,
//! idempotent rebuild of a per-month read projection from events. Grounded on
//! the teacher's `batch_update.rs` / `write_partition.rs` write-temp-then-move
//! pattern and `partition_metadata.rs`'s "insert never update" manifest
//! philosophy, generalized here to the `.tmp/` + status-manifest state
//! machine this spec describes (the teacher tracks partition status in
//! Postgres rows; here it lives in the manifest object itself).

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{RecordBatch, UInt32Array};
use arrow::compute::take_record_batch;
use chrono::Utc;
use ingestor_store::BlobStore;
use ingestor_types::hash::row_key_hash;
use ingestor_types::manifest::EventManifest;
use tracing::{debug, info, warn};

use crate::manifest::{ConsolidationManifest, ConsolidationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    /// Already `completed` and no new month-touching event since; nothing done.
    Skipped,
    Rebuilt { rows: usize },
}

/// Consolidates `(year, month)` for `dataset_id` per the state machine of
/// spec §4.I. Idempotent: safe to call repeatedly, including after a crash
/// mid-way (the manifest is left `in_progress` and the next call redoes the
/// month from events). Already-`completed` months with no event newer than
/// the one last folded in are left untouched (`ConsolidationOutcome::Skipped`).
#[tracing::instrument(skip(store))]
pub async fn consolidate_month(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
) -> anyhow::Result<ConsolidationOutcome> {
    let partition_keys = enumerate_event_partitions(store, dataset_id, year, month).await?;
    let events_root = ingestor_store::paths::events_root(dataset_id);
    let latest_version = partition_keys.iter().filter_map(|k| version_ts_of(k, &events_root)).max();

    if let Some(existing) = crate::manifest::read(store, dataset_id, year, month).await? {
        if existing.status == ConsolidationStatus::Completed && existing.last_version == latest_version {
            debug!(dataset_id, year, month, "already completed for the latest event; skipping");
            return Ok(ConsolidationOutcome::Skipped);
        }
    }

    cleanup_temp_projections(store, dataset_id, year, month).await?;

    write_manifest(store, dataset_id, year, month, ConsolidationStatus::InProgress, None).await?;

    if partition_keys.is_empty() {
        write_manifest(store, dataset_id, year, month, ConsolidationStatus::Completed, latest_version).await?;
        return Ok(ConsolidationOutcome::Rebuilt { rows: 0 });
    }

    let primary_keys = primary_keys_for(store, dataset_id, &partition_keys).await?;
    let consolidated = read_concat_dedupe(store, &partition_keys, &primary_keys).await?;
    let rows = consolidated.num_rows();

    let temp_key = ingestor_store::paths::projection_temp_key(dataset_id, year, month);
    store.put_parquet(&temp_key, &consolidated).await?;

    let final_key = ingestor_store::paths::projection_key(dataset_id, year, month);
    store.copy_object(&temp_key, &final_key).await?;
    store.delete_object(&temp_key).await?;

    write_manifest(store, dataset_id, year, month, ConsolidationStatus::Completed, latest_version).await?;
    cleanup_temp_projections(store, dataset_id, year, month).await.ok();

    info!(dataset_id, year, month, rows, "consolidated month");
    Ok(ConsolidationOutcome::Rebuilt { rows })
}

async fn write_manifest(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
    status: ConsolidationStatus,
    last_version: Option<String>,
) -> anyhow::Result<()> {
    crate::manifest::write(
        store,
        &ConsolidationManifest {
            dataset_id: dataset_id.to_string(),
            year,
            month,
            status,
            timestamp: Utc::now().to_rfc3339(),
            last_version,
        },
    )
    .await?;
    Ok(())
}

/// Deletes everything under `projections/windows/Y/M/.tmp/` (spec §4.I step 1).
async fn cleanup_temp_projections(store: &BlobStore, dataset_id: &str, year: i32, month: u32) -> anyhow::Result<()> {
    let prefix = ingestor_store::paths::projection_temp_prefix(dataset_id, year, month);
    let keys = store.list_objects(&prefix).await?;
    for key in keys {
        store.delete_object(&key).await?;
    }
    Ok(())
}

/// Fast path via the event index; falls back to listing when the index is
/// missing or empty, and rebuilds it for next time (spec §4.I step 3).
async fn enumerate_event_partitions(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
) -> anyhow::Result<Vec<String>> {
    if let Some(record) = ingestor_store::event_index::read(store, dataset_id, year, month).await? {
        if !record.versions.is_empty() {
            let mut versions = record.versions.clone();
            versions.sort();
            return Ok(versions
                .into_iter()
                .map(|v| ingestor_store::paths::event_partition_key(dataset_id, &v, year, month))
                .collect());
        }
    }

    warn!(dataset_id, year, month, "event index missing or empty; falling back to listing");
    let events_root = ingestor_store::paths::events_root(dataset_id);
    let events_index_prefix = format!("{events_root}index/");
    let suffix = format!("year={year:04}/month={month:02}/part-0.parquet");
    let all_keys = store.list_objects(&events_root).await?;
    let mut matching: Vec<String> = all_keys
        .into_iter()
        .filter(|k| !k.starts_with(&events_index_prefix))
        .filter(|k| k.ends_with(&suffix))
        .collect();
    matching.sort(); // version_ts is lexicographically sortable (spec §4.C)

    let now = Utc::now().to_rfc3339();
    for key in &matching {
        if let Some(version_ts) = version_ts_of(key, &events_root) {
            ingestor_store::event_index::upsert_version(store, dataset_id, year, month, &version_ts, &now).await?;
        }
    }

    Ok(matching)
}

fn version_ts_of(key: &str, events_root: &str) -> Option<String> {
    key.strip_prefix(events_root)
        .and_then(|rest| rest.split('/').next())
        .map(|s| s.to_string())
}

/// Reads the `key_columns` of the dataset's primary key from any one of the
/// event manifests covering these partitions (all versions of a dataset
/// share the same `primary_keys`, spec §3).
async fn primary_keys_for(store: &BlobStore, dataset_id: &str, partition_keys: &[String]) -> anyhow::Result<Vec<String>> {
    let events_root = ingestor_store::paths::events_root(dataset_id);
    for key in partition_keys {
        if let Some(version_ts) = version_ts_of(key, &events_root) {
            let manifest_key = ingestor_store::paths::event_manifest_key(dataset_id, &version_ts);
            if let Some((manifest, _)) = store.get_json::<EventManifest>(&manifest_key).await? {
                return Ok(manifest.index.key_columns);
            }
        }
    }
    Err(anyhow::anyhow!(
        "could not resolve primary_keys: no manifest found for any partition of {dataset_id}"
    ))
}

/// Reads every partition, concatenates in version order, and keeps only the
/// last occurrence of each primary-key hash (spec §3 "Projection", §4.I
/// step 4).
async fn read_concat_dedupe(
    store: &BlobStore,
    partition_keys: &[String],
    primary_keys: &[String],
) -> anyhow::Result<RecordBatch> {
    let mut batches = Vec::new();
    for key in partition_keys {
        if let Some(mut partition_batches) = store.get_parquet(key).await? {
            batches.append(&mut partition_batches);
        }
    }
    if batches.is_empty() {
        return Err(anyhow::anyhow!("no readable partitions among {partition_keys:?}"));
    }
    let schema = batches[0].schema();
    let concatenated = ingestor_store::concat_batches(&schema, &batches)?;
    debug!(rows_before_dedupe = concatenated.num_rows());

    let mut last_index_of: HashMap<String, usize> = HashMap::new();
    for row in 0..concatenated.num_rows() {
        let hash = row_key_hash(&concatenated, row, primary_keys)?;
        last_index_of.insert(hash, row);
    }
    let mut indices: Vec<usize> = last_index_of.into_values().collect();
    indices.sort_unstable();
    let take_indices = UInt32Array::from(indices.into_iter().map(|i| i as u32).collect::<Vec<_>>());

    Ok(take_record_batch(&concatenated, &take_indices)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Date32Array, Float64Array, StringArray, TimestampMillisecondArray};
    use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
    use chrono::TimeZone;
    use ingestor_types::fingerprint::SourceFingerprint;
    use ingestor_types::manifest::{EventManifestIndex, EventManifestOutputs, EventManifestSource};
    use ingestor_types::row::columns;
    use object_store::memory::InMemory;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()))
    }

    fn event_batch(codes: &[&str], month: u32) -> RecordBatch {
        let n = codes.len();
        let schema = Arc::new(Schema::new(vec![
            Field::new(
                columns::OBS_TIME,
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new(columns::OBS_DATE, DataType::Date32, false),
            Field::new(columns::VALUE, DataType::Float64, false),
            Field::new(columns::INTERNAL_SERIES_CODE, DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(TimestampMillisecondArray::from(vec![
                    Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap().timestamp_millis();
                    n
                ])
                .with_timezone("UTC")),
                Arc::new(Date32Array::from(vec![0; n])),
                Arc::new(Float64Array::from(vec![1.0; n])),
                Arc::new(StringArray::from(codes.to_vec())),
            ],
        )
        .unwrap()
    }

    async fn seed_version(store: &BlobStore, version_ts: &str, codes: &[&str], year: i32, month: u32) {
        let partition_key = ingestor_store::paths::event_partition_key("cpi", version_ts, year, month);
        store.put_parquet(&partition_key, &event_batch(codes, month)).await.unwrap();
        let manifest_key = ingestor_store::paths::event_manifest_key("cpi", version_ts);
        let manifest = EventManifest {
            dataset_id: "cpi".into(),
            version: version_ts.into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            source: EventManifestSource {
                files: vec![SourceFingerprint::of(b"src")],
            },
            outputs: EventManifestOutputs {
                data_prefix: ingestor_store::paths::event_prefix("cpi", version_ts),
                files: vec![partition_key.clone()],
                rows_total: codes.len() as u64,
                rows_added_this_version: codes.len() as u64,
            },
            index: EventManifestIndex {
                path: ingestor_store::paths::index_key("cpi"),
                key_columns: vec!["internal_series_code".to_string()],
                hash_column: "key_hash".to_string(),
            },
        };
        store.put_json(&manifest_key, &manifest, ingestor_store::PutCondition::Overwrite).await.unwrap();
        let now = Utc::now().to_rfc3339();
        ingestor_store::event_index::upsert_version(store, "cpi", year, month, version_ts, &now).await.unwrap();
    }

    #[tokio::test]
    async fn consolidates_single_version_month() {
        let store = store();
        seed_version(&store, "v1", &["a", "b"], 2024, 1).await;
        let outcome = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(outcome, ConsolidationOutcome::Rebuilt { rows: 2 });
        let manifest = crate::manifest::read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(manifest.status, ConsolidationStatus::Completed);
    }

    #[tokio::test]
    async fn second_version_deduplicates_overlapping_keys() {
        let store = store();
        seed_version(&store, "v1", &["a", "b"], 2024, 1).await;
        seed_version(&store, "v2", &["b", "c"], 2024, 1).await;
        let outcome = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(outcome, ConsolidationOutcome::Rebuilt { rows: 3 });
    }

    #[tokio::test]
    async fn rerun_on_completed_month_is_idempotent() {
        let store = store();
        seed_version(&store, "v1", &["a", "b"], 2024, 1).await;
        consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        let first = store.get_parquet(&ingestor_store::paths::projection_key("cpi", 2024, 1)).await.unwrap().unwrap();
        consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        let second = store.get_parquet(&ingestor_store::paths::projection_key("cpi", 2024, 1)).await.unwrap().unwrap();
        assert_eq!(first[0].num_rows(), second[0].num_rows());
    }

    #[tokio::test]
    async fn completed_month_with_no_new_version_is_skipped() {
        let store = store();
        seed_version(&store, "v1", &["a", "b"], 2024, 1).await;
        let first = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(first, ConsolidationOutcome::Rebuilt { rows: 2 });

        let second = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(second, ConsolidationOutcome::Skipped);

        // A later version touching the same month forces a real rebuild again.
        seed_version(&store, "v2", &["c"], 2024, 1).await;
        let third = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(third, ConsolidationOutcome::Rebuilt { rows: 3 });
    }

    #[tokio::test]
    async fn crash_after_temp_write_is_cleaned_up_and_redone() {
        let store = store();
        seed_version(&store, "v1", &["a", "b"], 2024, 1).await;
        // Simulate the S5 crash window: a stray .tmp file and an in_progress manifest.
        let temp_key = ingestor_store::paths::projection_temp_key("cpi", 2024, 1);
        store.put_parquet(&temp_key, &event_batch(&["stale"], 1)).await.unwrap();
        write_manifest(&store, "cpi", 2024, 1, ConsolidationStatus::InProgress, None).await.unwrap();

        let outcome = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(outcome, ConsolidationOutcome::Rebuilt { rows: 2 });
        assert!(store.get_object(&temp_key).await.unwrap().is_none());
        let manifest = crate::manifest::read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(manifest.status, ConsolidationStatus::Completed);
    }

    #[tokio::test]
    async fn missing_event_index_falls_back_to_listing() {
        let store = store();
        seed_version(&store, "v1", &["a"], 2024, 1).await;
        // Drop the event index to force the listing fallback.
        let index_key = ingestor_store::paths::event_index_key("cpi", 2024, 1);
        store.delete_object(&index_key).await.unwrap();

        let outcome = consolidate_month(&store, "cpi", 2024, 1).await.unwrap();
        assert_eq!(outcome, ConsolidationOutcome::Rebuilt { rows: 1 });
        // Fallback rebuilds the index for next time.
        assert!(ingestor_store::event_index::read(&store, "cpi", 2024, 1).await.unwrap().is_some());
    }
}
