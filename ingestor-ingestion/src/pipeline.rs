//! The pipeline driver: orders every other component, owns the lock's
//! acquire/release pair, and is the single place that collapses internal
//! errors into a structured, non-panicking result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use ingestor_store::{BlobStore, LockTable};
use ingestor_types::{IngestionConfig, SourceFingerprint};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capabilities::{CapabilityRegistry, Fetcher};
use crate::consistency::{rebuild_from_pointer, verify, Consistency};
use crate::delta::{compute_delta, empty_index};
use crate::enrich::enrich;
use crate::error::PipelineError;
use crate::event_writer::write_events;
use crate::notify::{NotificationPayload, Notifier};
use crate::publisher::{publish, EventManifest, Pointer, PublishRequest};

/// Outcome of a single invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    NoChange,
    NoNewData,
    CasConflict,
    SkippedLock,
    Error,
}

/// The structured result every run produces; never a panic, never an
/// unhandled error.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub run_id: String,
    pub version_ts: String,
    pub status: RunStatus,
    pub rows_added: u64,
    /// Post-publish index cardinality, when known.
    pub rows_total: Option<u64>,
    pub error: Option<String>,
}

impl PipelineResult {
    fn with_status(run_id: String, version_ts: String, status: RunStatus) -> Self {
        Self {
            run_id,
            version_ts,
            status,
            rows_added: 0,
            rows_total: None,
            error: None,
        }
    }

    fn error(run_id: String, version_ts: String, err: &PipelineError) -> Self {
        Self {
            run_id,
            version_ts,
            status: RunStatus::Error,
            rows_added: 0,
            rows_total: None,
            error: Some(format!("{err:#}")),
        }
    }
}

/// Collaborators a run needs, injected rather than constructed.
pub struct PipelineDeps {
    pub store: BlobStore,
    pub lock_table: Option<Arc<dyn LockTable>>,
    pub fetcher: Arc<dyn Fetcher>,
    pub registry: CapabilityRegistry,
    pub notifier: Arc<dyn Notifier>,
}

/// Runs the pipeline once for `config`. `now` is injected so the lag filter,
/// enrichment timestamps, and run id are reproducible in tests.
#[tracing::instrument(skip(config, deps), fields(dataset_id = %config.dataset_id))]
pub async fn run(config: &IngestionConfig, deps: &PipelineDeps, now: DateTime<Utc>) -> PipelineResult {
    let run_id = Uuid::new_v4().to_string();
    let version_ts = ingestor_store::paths::format_version_ts(now);

    if let Err(e) = config.validate() {
        let err = PipelineError::Validation(e.to_string());
        warn!(dataset_id = %config.dataset_id, error = %err, "config validation failed");
        return PipelineResult::error(run_id, version_ts, &err);
    }

    let lock_key = config.lock_key();
    if config.locking_enabled() {
        let lock_table = deps.lock_table.clone().expect("locking_enabled implies lock_table");
        match lock_table.acquire(&lock_key, &run_id, config.lock_ttl_seconds).await {
            Ok(true) => {}
            Ok(false) => {
                info!(dataset_id = %config.dataset_id, "lock held by another run; skipping");
                return PipelineResult::with_status(run_id, version_ts, RunStatus::SkippedLock);
            }
            Err(e) => {
                let err = PipelineError::Lock(e.to_string());
                return PipelineResult::error(run_id, version_ts, &err);
            }
        }
    }

    let outcome = run_locked(config, deps, now, &run_id, &version_ts).await;

    if config.locking_enabled() {
        let lock_table = deps.lock_table.clone().expect("locking_enabled implies lock_table");
        if let Err(e) = lock_table.release(&lock_key, &run_id).await {
            warn!(dataset_id = %config.dataset_id, error = %e, "failed to release lock; it will expire via TTL");
        }
    }

    match outcome {
        Ok(result) => result,
        Err(e) => PipelineResult::error(run_id, version_ts, &e),
    }
}

async fn run_locked(
    config: &IngestionConfig,
    deps: &PipelineDeps,
    now: DateTime<Utc>,
    run_id: &str,
    version_ts: &str,
) -> Result<PipelineResult, PipelineError> {
    let store = &deps.store;

    if verify(store, &config.dataset_id, config.consistency_tolerance).await? == Consistency::Inconsistent {
        warn!(dataset_id = %config.dataset_id, "consistency guard found drift; rebuilding index from events");
        let rebuilt = rebuild_from_pointer(store, &config.dataset_id).await?;
        store
            .put_parquet(&ingestor_store::paths::index_key(&config.dataset_id), &rebuilt)
            .await?;
    }

    let bytes = deps.fetcher.fetch(config).await?;
    let fingerprint = SourceFingerprint::of(&bytes);

    let pointer_key = ingestor_store::paths::pointer_key(&config.dataset_id);
    let pointer = store.get_json::<Pointer>(&pointer_key).await?;

    if !config.full_reload {
        if let Some((pointer, _)) = &pointer {
            let manifest_key = ingestor_store::paths::event_manifest_key(&config.dataset_id, &pointer.current_version);
            if let Some((manifest, _)) = store.get_json::<EventManifest>(&manifest_key).await? {
                if let Some(prev) = manifest.source.files.first() {
                    if *prev == fingerprint {
                        info!(dataset_id = %config.dataset_id, "source fingerprint unchanged; no_change");
                        return Ok(PipelineResult::with_status(
                            run_id.to_string(),
                            version_ts.to_string(),
                            RunStatus::NoChange,
                        ));
                    }
                }
            }
        }
    }

    let parser = deps.registry.parser(&config.parser_tag)?;
    let parsed = parser.parse(bytes, config).await?;
    let date_filtered = crate::datefilter::filter_by_lag(&parsed, config.lag_days, now)?;
    let normalizer = deps.registry.normalizer(&config.normalizer_tag)?;
    let normalized = normalizer.normalize(date_filtered, config).await?;

    let index_key = ingestor_store::paths::index_key(&config.dataset_id);
    let current_index = if config.full_reload {
        empty_index()
    } else {
        match store.get_parquet(&index_key).await? {
            Some(batches) if !batches.is_empty() => {
                ingestor_store::concat_batches(&ingestor_types::row::index_schema(), &batches)?
            }
            _ => empty_index(),
        }
    };

    let delta_result = compute_delta(&normalized, &current_index, &config.primary_keys)?;
    if delta_result.delta.num_rows() == 0 {
        info!(dataset_id = %config.dataset_id, "delta is empty; no_new_data");
        return Ok(PipelineResult::with_status(
            run_id.to_string(),
            version_ts.to_string(),
            RunStatus::NoNewData,
        ));
    }

    let rows_added = delta_result.delta.num_rows() as u64;
    let enriched = enrich(&delta_result.delta, version_ts, now)?;
    let write_result = write_events(store, &config.dataset_id, version_ts, &enriched).await?;

    let publish_outcome = publish(
        store,
        PublishRequest {
            dataset_id: config.dataset_id.clone(),
            version_ts: version_ts.to_string(),
            created_at: now.to_rfc3339(),
            source_fingerprint: fingerprint,
            event_keys: write_result.written.clone(),
            rows_added,
            primary_keys: config.primary_keys.clone(),
            updated_index: delta_result.updated_index,
        },
    )
    .await?;

    if !publish_outcome.published {
        info!(dataset_id = %config.dataset_id, "pointer CAS lost the race");
        return Ok(PipelineResult::with_status(
            run_id.to_string(),
            version_ts.to_string(),
            RunStatus::CasConflict,
        ));
    }

    for &(year, month) in &write_result.affected_months {
        match ingestor_lakehouse::consolidate_month(store, &config.dataset_id, year, month).await {
            Ok(ingestor_lakehouse::ConsolidationOutcome::Rebuilt { rows }) => {
                info!(dataset_id = %config.dataset_id, year, month, rows, "consolidated month");
            }
            Ok(ingestor_lakehouse::ConsolidationOutcome::Skipped) => {
                info!(dataset_id = %config.dataset_id, year, month, "consolidation already up to date; skipped");
            }
            Err(e) => {
                // A consolidation failure leaves the manifest `in_progress`
                // and does not retract the publish; the next run self-heals.
                warn!(dataset_id = %config.dataset_id, year, month, error = %e, "consolidation failed; will retry next run");
            }
        }
    }

    if let Some(topic) = &config.notify_topic {
        let payload = NotificationPayload::dataset_updated(
            config.dataset_id.clone(),
            now.to_rfc3339(),
            ingestor_store::paths::pointer_key(&config.dataset_id),
        );
        if let Err(e) = deps.notifier.notify(payload).await {
            warn!(dataset_id = %config.dataset_id, topic, error = %e, "notification failed; publish already committed");
        }
    }

    let index_key = ingestor_store::paths::index_key(&config.dataset_id);
    let rows_total = store
        .get_parquet(&index_key)
        .await?
        .map(|batches| batches.iter().map(|b| b.num_rows()).sum::<usize>() as u64);

    let mut result = PipelineResult::with_status(run_id.to_string(), version_ts.to_string(), RunStatus::Completed);
    result.rows_added = rows_added;
    result.rows_total = rows_total;
    Ok(result)
}
