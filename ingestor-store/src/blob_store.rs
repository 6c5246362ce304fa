//! The object store adapter: `get/put/delete/list/head`, CAS put with
//! `if_match`, and Parquet/JSON codec helpers so callers never see a
//! streaming seam. Wraps `Arc<dyn ObjectStore>`.

use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;
use crate::retry;

const DEFAULT_RETRY_ATTEMPTS: usize = 4;

/// A successfully read object: its bytes and the ETag it was read at.
#[derive(Debug, Clone)]
pub struct ObjectHandle {
    pub bytes: Bytes,
    pub etag: Option<String>,
}

/// The CAS condition under which a `put_object` is attempted.
#[derive(Debug, Clone)]
pub enum PutCondition {
    /// Write unconditionally, clobbering whatever is there.
    Overwrite,
    /// Succeed only if the object does not already exist.
    CreateIfAbsent,
    /// Succeed only if the live ETag equals `etag` (`if_match`, never `"*"`).
    IfMatch(String),
}

fn put_options(condition: &PutCondition) -> PutOptions {
    match condition {
        PutCondition::Overwrite => PutOptions::default(),
        PutCondition::CreateIfAbsent => PutMode::Create.into(),
        PutCondition::IfMatch(etag) => PutMode::Update(UpdateVersion {
            e_tag: Some(etag.clone()),
            version: None,
        })
        .into(),
    }
}

fn to_store_error(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound(key.to_string()),
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StoreError::PreconditionFailed(key.to_string())
        }
        other => StoreError::Io {
            path: key.to_string(),
            source: anyhow::anyhow!(other),
        },
    }
}

/// Thin wrapper over `Arc<dyn ObjectStore>` presenting the key/value/CAS
/// surface the rest of the pipeline depends on.
#[derive(Clone)]
pub struct BlobStore {
    store: Arc<dyn ObjectStore>,
}

impl BlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Connects from a URL (`s3://bucket/prefix`, `file:///...`, `memory:///`).
    pub fn connect(object_store_url: &str) -> anyhow::Result<Self> {
        let (store, _root) = object_store::parse_url(&url::Url::parse(object_store_url)?)?;
        Ok(Self { store: store.into() })
    }

    pub fn inner(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn get_object(&self, key: &str) -> Result<Option<ObjectHandle>, StoreError> {
        let path = Path::from(key);
        let store = self.store.clone();
        let result = retry::with_retry(DEFAULT_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let path = path.clone();
            async move { store.get(&path).await }
        })
        .await;
        match result {
            Ok(get_result) => {
                let etag = get_result.meta.e_tag.clone();
                let bytes = get_result
                    .bytes()
                    .await
                    .map_err(|e| to_store_error(key, e))?;
                Ok(Some(ObjectHandle { bytes, etag }))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(to_store_error(key, e)),
        }
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn head_object(&self, key: &str) -> Result<Option<String>, StoreError> {
        let path = Path::from(key);
        let store = self.store.clone();
        let result = retry::with_retry(DEFAULT_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let path = path.clone();
            async move { store.head(&path).await }
        })
        .await;
        match result {
            Ok(meta) => Ok(meta.e_tag),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(to_store_error(key, e)),
        }
    }

    /// CAS put. `precondition_failed` is surfaced as
    /// [`StoreError::PreconditionFailed`], never retried internally.
    #[tracing::instrument(skip(self, bytes), level = "debug")]
    pub async fn put_object(
        &self,
        key: &str,
        bytes: Bytes,
        condition: PutCondition,
    ) -> Result<String, StoreError> {
        let path = Path::from(key);
        let store = self.store.clone();
        let opts = put_options(&condition);
        let result = retry::with_retry(DEFAULT_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let path = path.clone();
            let payload: PutPayload = bytes.clone().into();
            let opts = opts.clone();
            async move { store.put_opts(&path, payload, opts).await }
        })
        .await;
        match result {
            Ok(put_result) => Ok(put_result.e_tag.unwrap_or_default()),
            Err(e) => Err(to_store_error(key, e)),
        }
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn delete_object(&self, key: &str) -> Result<(), StoreError> {
        let path = Path::from(key);
        let store = self.store.clone();
        let result = retry::with_retry(DEFAULT_RETRY_ATTEMPTS, move || {
            let store = store.clone();
            let path = path.clone();
            async move { store.delete(&path).await }
        })
        .await;
        match result {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(to_store_error(key, e)),
        }
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let path = Path::from(prefix);
        let stream = self.store.list(Some(&path));
        let metas: Vec<object_store::ObjectMeta> = stream
            .try_collect()
            .await
            .map_err(|e| to_store_error(prefix, e))?;
        let mut keys: Vec<String> = metas.into_iter().map(|m| m.location.to_string()).collect();
        keys.sort();
        Ok(keys)
    }

    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn copy_object(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let src_path = Path::from(src);
        let dst_path = Path::from(dst);
        self.store
            .copy(&src_path, &dst_path)
            .await
            .map_err(|e| to_store_error(src, e))
    }

    pub async fn put_json<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        condition: PutCondition,
    ) -> Result<String, StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Codec(key.to_string(), e.into()))?;
        self.put_object(key, Bytes::from(bytes), condition).await
    }

    /// Returns `None` when the object is absent, otherwise the decoded value
    /// and the ETag it was read at (needed by the publisher's CAS retry).
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<(T, Option<String>)>, StoreError> {
        match self.get_object(key).await? {
            None => Ok(None),
            Some(handle) => {
                let value = serde_json::from_slice(&handle.bytes)
                    .map_err(|e| StoreError::Codec(key.to_string(), e.into()))?;
                Ok(Some((value, handle.etag)))
            }
        }
    }

    /// Encodes `batch` as a single-row-group Parquet file in memory and
    /// writes it unconditionally. Returns the written byte size.
    pub async fn put_parquet(&self, key: &str, batch: &RecordBatch) -> Result<usize, StoreError> {
        let bytes = encode_parquet(batch).map_err(|e| StoreError::Codec(key.to_string(), e))?;
        let size = bytes.len();
        self.put_object(key, bytes, PutCondition::Overwrite).await?;
        Ok(size)
    }

    /// Reads and decodes a Parquet object, or `None` if absent.
    pub async fn get_parquet(&self, key: &str) -> Result<Option<Vec<RecordBatch>>, StoreError> {
        match self.get_object(key).await? {
            None => Ok(None),
            Some(handle) => {
                let batches = decode_parquet(handle.bytes)
                    .map_err(|e| StoreError::Codec(key.to_string(), e))?;
                Ok(Some(batches))
            }
        }
    }
}

fn encode_parquet(batch: &RecordBatch) -> anyhow::Result<Bytes> {
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(Bytes::from(buffer))
}

fn decode_parquet(bytes: Bytes) -> anyhow::Result<Vec<RecordBatch>> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)?;
    let reader = builder.build()?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

/// Concatenates parquet batches read with differing row-group boundaries
/// back into one batch of the given schema, used by callers that want a
/// single logical frame out of possibly-many row groups.
pub fn concat_batches(schema: &SchemaRef, batches: &[RecordBatch]) -> anyhow::Result<RecordBatch> {
    Ok(arrow::compute::concat_batches(schema, batches)?)
}
