//! The per-month event index: `events/index/YYYY/MM/versions.json`, an
//! append-only, best-effort optimization. A lost update under concurrent
//! writers is tolerated — the consolidator falls back to listing when an
//! entry is missing or stale.

use serde::{Deserialize, Serialize};

use crate::blob_store::{BlobStore, PutCondition};
use crate::error::StoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventIndexRecord {
    pub dataset_id: String,
    pub year: i32,
    pub month: u32,
    pub versions: Vec<String>,
    pub last_updated: String,
    pub event_count: u64,
}

pub async fn read(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
) -> Result<Option<EventIndexRecord>, StoreError> {
    let key = crate::paths::event_index_key(dataset_id, year, month);
    Ok(store.get_json::<EventIndexRecord>(&key).await?.map(|(record, _)| record))
}

/// Adds `version_ts` to the month's index, creating the record if absent.
/// Overwrites unconditionally: a race losing one version is an accepted,
/// documented gap — see [`crate::lock`] module docs for the analogous
/// tradeoff on lock release.
pub async fn upsert_version(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
    version_ts: &str,
    now_rfc3339: &str,
) -> Result<(), StoreError> {
    let key = crate::paths::event_index_key(dataset_id, year, month);
    let mut record = match read(store, dataset_id, year, month).await? {
        Some(record) => record,
        None => EventIndexRecord {
            dataset_id: dataset_id.to_string(),
            year,
            month,
            versions: Vec::new(),
            last_updated: now_rfc3339.to_string(),
            event_count: 0,
        },
    };
    if !record.versions.iter().any(|v| v == version_ts) {
        record.versions.push(version_ts.to_string());
        record.event_count = record.versions.len() as u64;
    }
    record.last_updated = now_rfc3339.to_string();
    store.put_json(&key, &record, PutCondition::Overwrite).await?;
    Ok(())
}

/// Undoes an [`upsert_version`] for `version_ts`, leaving any other versions
/// already recorded for the month untouched. Used to roll back an index
/// entry for a version whose event write is itself being rolled back.
/// A no-op if the month has no index record, or the version isn't in it.
pub async fn remove_version(
    store: &BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
    version_ts: &str,
    now_rfc3339: &str,
) -> Result<(), StoreError> {
    let key = crate::paths::event_index_key(dataset_id, year, month);
    let Some(mut record) = read(store, dataset_id, year, month).await? else {
        return Ok(());
    };
    let before = record.versions.len();
    record.versions.retain(|v| v != version_ts);
    if record.versions.len() == before {
        return Ok(());
    }
    record.event_count = record.versions.len() as u64;
    record.last_updated = now_rfc3339.to_string();
    store.put_json(&key, &record, PutCondition::Overwrite).await?;
    Ok(())
}
