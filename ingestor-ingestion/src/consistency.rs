//! The consistency guard: runs before delta computation on every invocation,
//! and is the pipeline's only self-healing mechanism for the window where a
//! pointer CAS succeeded but the index write that follows it did not. Lists
//! and rebuilds the derived index from source-of-truth event partitions.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{RecordBatch, StringArray};
use ingestor_store::BlobStore;
use ingestor_types::hash::row_key_hash;
use ingestor_types::row::index_schema;
use tracing::{info, warn};

use crate::publisher::{EventManifest, Pointer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Consistent,
    Inconsistent,
}

/// Absent pointer is consistent iff the index is empty or absent; otherwise
/// checks `|index| - manifest.outputs.rows_total|` is within `tolerance`.
#[tracing::instrument(skip(store))]
pub async fn verify(store: &BlobStore, dataset_id: &str, tolerance: u64) -> anyhow::Result<Consistency> {
    let pointer_key = ingestor_store::paths::pointer_key(dataset_id);
    let pointer = store.get_json::<Pointer>(&pointer_key).await?;

    let index_key = ingestor_store::paths::index_key(dataset_id);
    let index_rows = match store.get_parquet(&index_key).await? {
        Some(batches) => batches.iter().map(|b| b.num_rows()).sum::<usize>(),
        None => 0,
    };

    let Some((pointer, _)) = pointer else {
        return Ok(if index_rows == 0 {
            Consistency::Consistent
        } else {
            warn!(dataset_id, index_rows, "index is non-empty but no pointer exists");
            Consistency::Inconsistent
        });
    };

    let manifest_key = ingestor_store::paths::event_manifest_key(dataset_id, &pointer.current_version);
    let manifest = store
        .get_json::<EventManifest>(&manifest_key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("pointer references missing manifest {manifest_key}"))?
        .0;

    let drift = (index_rows as i64 - manifest.outputs.rows_total as i64).unsigned_abs();
    if drift <= tolerance {
        Ok(Consistency::Consistent)
    } else {
        warn!(dataset_id, drift, tolerance, "index/manifest drift exceeds tolerance");
        Ok(Consistency::Inconsistent)
    }
}

/// Recomputes `index/keys.parquet` from every event at or before
/// `current_version`, read from source of truth.
#[tracing::instrument(skip(store))]
pub async fn rebuild_from_pointer(store: &BlobStore, dataset_id: &str) -> anyhow::Result<RecordBatch> {
    let pointer_key = ingestor_store::paths::pointer_key(dataset_id);
    let Some((pointer, _)) = store.get_json::<Pointer>(&pointer_key).await? else {
        return Ok(RecordBatch::new_empty(index_schema()));
    };

    let manifest_key = ingestor_store::paths::event_manifest_key(dataset_id, &pointer.current_version);
    let manifest = store
        .get_json::<EventManifest>(&manifest_key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("pointer references missing manifest {manifest_key}"))?
        .0;
    let primary_keys = manifest.index.key_columns;

    let events_root = ingestor_store::paths::events_root(dataset_id);
    let events_index_prefix = format!("{events_root}index/");
    let all_keys = store.list_objects(&events_root).await?;

    let mut partition_keys: Vec<String> = all_keys
        .into_iter()
        .filter(|k| !k.starts_with(&events_index_prefix))
        .filter(|k| k.ends_with(".parquet"))
        .filter(|k| {
            version_ts_of(k, &events_root)
                .map(|v| v <= pointer.current_version)
                .unwrap_or(false)
        })
        .collect();
    partition_keys.sort(); // lexicographic == temporal, given the version_ts format

    let mut seen = HashSet::new();
    for key in &partition_keys {
        let Some(batches) = store.get_parquet(key).await? else {
            continue;
        };
        for batch in &batches {
            for row in 0..batch.num_rows() {
                seen.insert(row_key_hash(batch, row, &primary_keys)?);
            }
        }
    }

    info!(dataset_id, partitions = partition_keys.len(), keys = seen.len(), "rebuilt index from events");

    let hashes: Vec<String> = seen.into_iter().collect();
    Ok(RecordBatch::try_new(index_schema(), vec![Arc::new(StringArray::from(hashes))])?)
}

fn version_ts_of(key: &str, events_root: &str) -> Option<String> {
    key.strip_prefix(events_root)
        .and_then(|rest| rest.split('/').next())
        .map(|s| s.to_string())
}
