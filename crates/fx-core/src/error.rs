use thiserror::Error;

#[derive(Debug, Error)]
pub enum FxCoreError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),

    /// The asset table already holds rows that don't match the configured
    /// list, and the caller asked to be told about it rather than skip it.
    #[error("assets already initialized with a conflicting list")]
    AlreadyPopulated,
}

pub type FxCoreResult<T> = Result<T, FxCoreError>;
