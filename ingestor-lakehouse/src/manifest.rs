//! Per-month consolidation manifest (spec §3 "Consolidation manifest"):
//! `projections/consolidation/YYYY/MM/manifest.json`, the status record that
//! makes projection rebuilds idempotent across crashes (spec §4.I).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationManifest {
    pub dataset_id: String,
    pub year: i32,
    pub month: u32,
    pub status: ConsolidationStatus,
    pub timestamp: String,
    /// The most recent event `version_ts` folded into this projection, when
    /// known. Lets a later call detect "`completed` and no new month touched"
    /// and skip redoing work that's already current.
    #[serde(default)]
    pub last_version: Option<String>,
}

pub fn key(dataset_id: &str, year: i32, month: u32) -> String {
    ingestor_store::paths::consolidation_manifest_key(dataset_id, year, month)
}

pub async fn read(
    store: &ingestor_store::BlobStore,
    dataset_id: &str,
    year: i32,
    month: u32,
) -> Result<Option<ConsolidationManifest>, ingestor_store::StoreError> {
    Ok(store.get_json(&key(dataset_id, year, month)).await?.map(|(m, _)| m))
}

pub async fn write(
    store: &ingestor_store::BlobStore,
    manifest: &ConsolidationManifest,
) -> Result<(), ingestor_store::StoreError> {
    store
        .put_json(
            &key(&manifest.dataset_id, manifest.year, manifest.month),
            manifest,
            ingestor_store::PutCondition::Overwrite,
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::sync::Arc;

    #[tokio::test]
    async fn round_trips_status() {
        let store = ingestor_store::BlobStore::new(Arc::new(InMemory::new()));
        let manifest = ConsolidationManifest {
            dataset_id: "cpi".into(),
            year: 2024,
            month: 1,
            status: ConsolidationStatus::InProgress,
            timestamp: "2024-01-01T00:00:00Z".into(),
            last_version: None,
        };
        write(&store, &manifest).await.unwrap();
        let read_back = read(&store, "cpi", 2024, 1).await.unwrap().unwrap();
        assert_eq!(read_back.status, ConsolidationStatus::InProgress);
    }

    #[tokio::test]
    async fn missing_manifest_is_none() {
        let store = ingestor_store::BlobStore::new(Arc::new(InMemory::new()));
        assert!(read(&store, "cpi", 2024, 1).await.unwrap().is_none());
    }
}
