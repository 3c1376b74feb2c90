//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the ingestion engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The caller holds too many concurrent upload permits. Retryable.
    #[error("too many concurrent uploads, retry later")]
    AdmissionDenied,

    /// The upload would push the account past its space limit. Fatal for
    /// this attempt and safe to show to the user.
    #[error("storage quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: i64, available: i64 },

    /// A chunk landed on disk with a different size than it arrived with.
    /// The chunk can be re-sent.
    #[error("chunk {index} size mismatch: received {received} bytes, wrote {written}")]
    ChunkIntegrity {
        index: u32,
        received: u64,
        written: u64,
    },

    /// Chunk merge failed. The upload is terminal; resume state is gone.
    #[error("merge failed: {0}")]
    Assembly(String),

    /// A chunk arrived for a session that does not exist (never opened,
    /// already committed, or swept after expiry).
    #[error("no upload session for this file")]
    SessionMissing,

    /// Both the primary and backup backends refused the operation.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] depot_storage::StorageError),

    /// Media post-processing failed. Non-fatal to the upload; the record
    /// is marked transfer-failed instead.
    #[error("transcode failed: {0}")]
    Transcode(String),

    #[error(transparent)]
    Core(#[from] depot_core::Error),

    #[error(transparent)]
    Metadata(#[from] depot_metadata::MetadataError),

    #[error(transparent)]
    Cache(#[from] depot_cache::CacheError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Short stable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied => "admission_denied",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ChunkIntegrity { .. } => "chunk_integrity",
            Self::Assembly(_) => "assembly",
            Self::SessionMissing => "session_missing",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Transcode(_) => "transcode",
            Self::Core(_) => "invalid_request",
            Self::Metadata(_) => "metadata",
            Self::Cache(_) => "cache",
            Self::Io(_) => "io",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AdmissionDenied | Self::ChunkIntegrity { .. } | Self::StorageUnavailable(_)
        )
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
