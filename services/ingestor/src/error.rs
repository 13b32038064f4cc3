use thiserror::Error;

/// Failure modes of a single upstream fetch. All are non-fatal at the tick
/// level: the caller logs and retries on the next tick.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream payload did not match the expected shape: {0}")]
    Format(String),
}

/// Failure of a whole tick. Only [`TickError::Store`] is allowed to
/// propagate out of a worker body — a fetch/format problem is caught and
/// logged inside `tick` itself, never reaching this type.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("store error during ingestion tick: {0}")]
    Store(#[from] fx_core::FxCoreError),
}
