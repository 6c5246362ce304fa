//! Pluggable parser/normalizer capability seams. The core depends on these
//! traits and a name→implementation registry; it never ships a concrete
//! parser or normalizer.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use ingestor_types::IngestionConfig;

/// Retrieves the raw source file (HTTP, file, object download, ...). An
/// external collaborator the driver depends on the same way it depends on
/// [`RowParser`] and [`RowNormalizer`].
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, config: &IngestionConfig) -> anyhow::Result<Bytes>;
}

/// Turns raw source bytes into a frame. Format-specific (CSV, Excel, ...);
/// selected by a string tag in the dataset config.
#[async_trait]
pub trait RowParser: Send + Sync {
    async fn parse(&self, bytes: Bytes, config: &IngestionConfig) -> anyhow::Result<RecordBatch>;
}

/// Maps a parsed frame onto [`ingestor_types::row::pre_enrichment_schema`],
/// applying per-dataset column renames, unit conversions, and quality
/// flagging. Selected the same way as [`RowParser`].
#[async_trait]
pub trait RowNormalizer: Send + Sync {
    async fn normalize(&self, frame: RecordBatch, config: &IngestionConfig) -> anyhow::Result<RecordBatch>;
}

/// A simple name→implementation map, keyed by the tag the dataset config
/// names under e.g. `parser` / `normalizer`.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    parsers: HashMap<String, Arc<dyn RowParser>>,
    normalizers: HashMap<String, Arc<dyn RowNormalizer>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_parser(&mut self, tag: impl Into<String>, parser: Arc<dyn RowParser>) {
        self.parsers.insert(tag.into(), parser);
    }

    pub fn register_normalizer(&mut self, tag: impl Into<String>, normalizer: Arc<dyn RowNormalizer>) {
        self.normalizers.insert(tag.into(), normalizer);
    }

    pub fn parser(&self, tag: &str) -> anyhow::Result<Arc<dyn RowParser>> {
        self.parsers
            .get(tag)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no parser registered for tag {tag}"))
    }

    pub fn normalizer(&self, tag: &str) -> anyhow::Result<Arc<dyn RowNormalizer>> {
        self.normalizers
            .get(tag)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no normalizer registered for tag {tag}"))
    }
}
