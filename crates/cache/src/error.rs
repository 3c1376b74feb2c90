//! Cache error types.

use thiserror::Error;

/// Cache operation errors.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("loader error: {0}")]
    Loader(String),

    #[error("tier error: {0}")]
    Tier(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
