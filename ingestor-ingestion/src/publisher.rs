//! The CAS publisher: writes the event manifest, advances the dataset
//! pointer by Compare-And-Swap, and — only on CAS success — writes the
//! updated primary-key index, built on the object-store CAS primitive of
//! [`ingestor_store::BlobStore`].

use arrow::array::RecordBatch;
use ingestor_store::{BlobStore, PutCondition};
use ingestor_types::manifest::{EventManifestIndex, EventManifestOutputs, EventManifestSource};
pub use ingestor_types::manifest::{EventManifest, Pointer};
use ingestor_types::SourceFingerprint;
use tracing::{info, warn};

pub struct PublishRequest {
    pub dataset_id: String,
    pub version_ts: String,
    pub created_at: String,
    pub source_fingerprint: SourceFingerprint,
    pub event_keys: Vec<String>,
    pub rows_added: u64,
    pub primary_keys: Vec<String>,
    pub updated_index: RecordBatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub published: bool,
    pub reason: Option<String>,
}

impl PublishOutcome {
    fn published() -> Self {
        Self { published: true, reason: None }
    }

    fn cas_conflict() -> Self {
        Self {
            published: false,
            reason: Some("cas_conflict".to_string()),
        }
    }
}

/// Runs the publish sequence. Returns `published:false` with
/// `reason:"cas_conflict"` on a lost pointer race; never retries the CAS
/// itself — precondition failures are never retried inside a run.
#[tracing::instrument(skip(store, req), fields(dataset_id = %req.dataset_id, version = %req.version_ts))]
pub async fn publish(store: &BlobStore, req: PublishRequest) -> anyhow::Result<PublishOutcome> {
    let rows_total = req.updated_index.num_rows() as u64;

    let manifest = EventManifest {
        dataset_id: req.dataset_id.clone(),
        version: req.version_ts.clone(),
        created_at: req.created_at.clone(),
        source: EventManifestSource {
            files: vec![req.source_fingerprint],
        },
        outputs: EventManifestOutputs {
            data_prefix: ingestor_store::paths::event_prefix(&req.dataset_id, &req.version_ts),
            files: req.event_keys.clone(),
            rows_total,
            rows_added_this_version: req.rows_added,
        },
        index: EventManifestIndex {
            path: ingestor_store::paths::index_key(&req.dataset_id),
            key_columns: req.primary_keys.clone(),
            hash_column: "key_hash".to_string(),
        },
    };

    // Safe to write unconditionally: lives under its own version prefix,
    // invisible to readers until the pointer references it.
    let manifest_key = ingestor_store::paths::event_manifest_key(&req.dataset_id, &req.version_ts);
    store.put_json(&manifest_key, &manifest, PutCondition::Overwrite).await?;

    let pointer_key = ingestor_store::paths::pointer_key(&req.dataset_id);
    let existing = store.get_json::<Pointer>(&pointer_key).await?;
    let new_pointer = Pointer {
        dataset_id: req.dataset_id.clone(),
        current_version: req.version_ts.clone(),
    };
    let condition = match &existing {
        None => PutCondition::CreateIfAbsent,
        Some((_, Some(etag))) => PutCondition::IfMatch(etag.clone()),
        Some((_, None)) => PutCondition::Overwrite,
    };

    match store.put_json(&pointer_key, &new_pointer, condition).await {
        Ok(_) => {}
        Err(e) if e.is_precondition_failed() => {
            warn!(dataset_id = %req.dataset_id, version = %req.version_ts, "pointer CAS lost the race");
            return Ok(PublishOutcome::cas_conflict());
        }
        Err(e) => return Err(e.into()),
    }

    let index_key = ingestor_store::paths::index_key(&req.dataset_id);
    store.put_parquet(&index_key, &req.updated_index).await?;

    info!(dataset_id = %req.dataset_id, version = %req.version_ts, rows_total, "published");
    Ok(PublishOutcome::published())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field, Schema};
    use object_store::memory::InMemory;
    use std::sync::Arc;

    fn store() -> BlobStore {
        BlobStore::new(Arc::new(InMemory::new()))
    }

    fn index(hashes: &[&str]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("key_hash", DataType::Utf8, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(hashes.to_vec()))]).unwrap()
    }

    fn req(dataset_id: &str, version_ts: &str, hashes: &[&str]) -> PublishRequest {
        PublishRequest {
            dataset_id: dataset_id.to_string(),
            version_ts: version_ts.to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            source_fingerprint: SourceFingerprint::of(b"source bytes"),
            event_keys: vec!["datasets/cpi/events/v/data/year=2024/month=01/part-0.parquet".to_string()],
            rows_added: hashes.len() as u64,
            primary_keys: vec!["internal_series_code".to_string()],
            updated_index: index(hashes),
        }
    }

    #[tokio::test]
    async fn cold_start_publish_creates_pointer() {
        let store = store();
        let outcome = publish(&store, req("cpi", "v1", &["a", "b"])).await.unwrap();
        assert!(outcome.published);
        let (pointer, _) = store
            .get_json::<Pointer>(&ingestor_store::paths::pointer_key("cpi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.current_version, "v1");
    }

    #[tokio::test]
    async fn index_is_written_only_after_successful_cas() {
        let store = store();
        publish(&store, req("cpi", "v1", &["a", "b"])).await.unwrap();
        let batches = store
            .get_parquet(&ingestor_store::paths::index_key("cpi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batches[0].num_rows(), 2);
    }

    #[tokio::test]
    async fn second_publish_advances_pointer() {
        let store = store();
        publish(&store, req("cpi", "v1", &["a"])).await.unwrap();
        let outcome = publish(&store, req("cpi", "v2", &["a", "b"])).await.unwrap();
        assert!(outcome.published);
        let (pointer, _) = store
            .get_json::<Pointer>(&ingestor_store::paths::pointer_key("cpi"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pointer.current_version, "v2");
    }

    #[tokio::test]
    async fn concurrent_cold_start_publishes_yield_exactly_one_winner() {
        let store = store();
        let (a, b) = tokio::join!(
            publish(&store, req("cpi", "v1", &["a"])),
            publish(&store, req("cpi", "v2", &["a", "b"]))
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let published = outcomes.iter().filter(|o| o.published).count();
        let conflicted = outcomes
            .iter()
            .filter(|o| !o.published && o.reason.as_deref() == Some("cas_conflict"))
            .count();
        assert_eq!(published, 1);
        assert_eq!(conflicted, 1);
    }
}
