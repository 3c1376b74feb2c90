//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid file id: {0}")]
    InvalidFileId(String),

    #[error("file type not allowed: .{0}")]
    BlockedSuffix(String),

    #[error("invalid chunk parameters: index {index} of {total}")]
    InvalidChunkParams { index: u32, total: u32 },

    #[error("record invariant violated: {0}")]
    InvalidRecord(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
