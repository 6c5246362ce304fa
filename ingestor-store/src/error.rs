use thiserror::Error;

/// Error taxonomy for the object-store adapter.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The object targeted by a read or conditional write does not exist.
    #[error("object not found: {0}")]
    NotFound(String),

    /// A CAS `put_object` lost the race: the live ETag no longer matches
    /// the caller's expectation, or the object already existed on a
    /// create-if-absent put.
    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    /// Exhausted the retry budget on a transient I/O error.
    #[error("transient I/O error writing/reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// A codec-level failure (malformed JSON, malformed Parquet).
    #[error("codec error for {0}: {1}")]
    Codec(String, anyhow::Error),
}

impl StoreError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, StoreError::PreconditionFailed(_))
    }
}
