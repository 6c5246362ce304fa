//! Object-store adapter, path layout, and conditional-write lock underlying
//! the ingestion pipeline.

pub mod blob_store;
pub mod error;
pub mod event_index;
pub mod lock;
pub mod paths;
mod retry;

pub use blob_store::{concat_batches, BlobStore, ObjectHandle, PutCondition};
pub use error::StoreError;
pub use event_index::EventIndexRecord;
pub use lock::{LockTable, ObjectStoreLockTable};
pub use retry::is_transient;
