//! Downstream notification: the message contract the core emits on success.
//! Delivery to a real broker/topic is an external concern; `NoopNotifier` is
//! the default when no topic is configured, `LoggingNotifier` is used in
//! tests and as a reference implementation.

use async_trait::async_trait;
use serde::Serialize;

/// `{type:"DATASET_UPDATED", timestamp, dataset_id, manifest_pointer}`.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    pub dataset_id: String,
    pub manifest_pointer: String,
}

impl NotificationPayload {
    pub fn dataset_updated(dataset_id: impl Into<String>, timestamp: String, manifest_pointer: String) -> Self {
        Self {
            kind: "DATASET_UPDATED".to_string(),
            timestamp,
            dataset_id: dataset_id.into(),
            manifest_pointer,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: NotificationPayload) -> anyhow::Result<()>;
}

/// Default notifier when `notify_topic` is unset.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _payload: NotificationPayload) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs the payload instead of publishing it; used in tests and as a
/// reference implementation for a topic-backed notifier.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, payload: NotificationPayload) -> anyhow::Result<()> {
        tracing::info!(dataset_id = %payload.dataset_id, manifest_pointer = %payload.manifest_pointer, "DATASET_UPDATED");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_notifier_always_succeeds() {
        let payload = NotificationPayload::dataset_updated("cpi", "2024-01-01T00:00:00Z".into(), "datasets/cpi/current/manifest.json".into());
        NoopNotifier.notify(payload).await.unwrap();
    }

    #[tokio::test]
    async fn logging_notifier_always_succeeds() {
        let payload = NotificationPayload::dataset_updated("cpi", "2024-01-01T00:00:00Z".into(), "datasets/cpi/current/manifest.json".into());
        LoggingNotifier.notify(payload).await.unwrap();
    }
}
