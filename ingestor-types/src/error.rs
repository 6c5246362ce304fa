use thiserror::Error;

/// Errors raised while building or validating frames, independent of any
/// storage or pipeline concern.
#[derive(Error, Debug)]
pub enum TypesError {
    #[error("missing column: {0}")]
    MissingColumn(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}
