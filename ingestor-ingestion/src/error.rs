use thiserror::Error;

/// Error taxonomy at the ingestion-crate boundary. Internal functions
/// propagate `anyhow::Error`; the driver is the single place that collapses
/// errors into a [`crate::pipeline::RunStatus`].
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error(transparent)]
    Storage(#[from] ingestor_store::StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
