//! Engine error types.
//!
//! Only programming errors and local I/O surface through `EngineError`.
//! Upstream failures never do: the retrying fetcher absorbs them into a
//! [`Retrieval::Failed`](crate::retry::Retrieval) value.

use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller supplied a malformed argument.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// An intermediate value had the wrong shape or type.
    #[error("invalid type: {0}")]
    InvalidType(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),
}

impl From<PolarsError> for EngineError {
    fn from(e: PolarsError) -> Self {
        EngineError::Frame(e.to_string())
    }
}

impl EngineError {
    /// True for errors that indicate a bug in the caller rather than bad luck.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidParameter(_) | EngineError::InvalidType(_)
        )
    }
}
