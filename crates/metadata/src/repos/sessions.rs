//! Upload session repository.

use crate::error::MetadataResult;
use crate::models::{UploadChunkRow, UploadSessionRow};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for resumable upload sessions and their chunk sets.
#[async_trait]
pub trait SessionRepo: Send + Sync {
    /// Create a session if none exists for this (user, hash) pair.
    /// A concurrent or re-sent first chunk finds the existing row; the
    /// declared `total_chunks` of the first writer wins.
    async fn init_session(&self, session: &UploadSessionRow) -> MetadataResult<()>;

    /// Get a session by its key.
    async fn get_session(
        &self,
        user_id: &str,
        content_hash: &str,
    ) -> MetadataResult<Option<UploadSessionRow>>;

    /// Get one completed chunk, if recorded.
    async fn get_chunk(
        &self,
        user_id: &str,
        content_hash: &str,
        chunk_index: u32,
    ) -> MetadataResult<Option<UploadChunkRow>>;

    /// Record a chunk as completed. Idempotent: re-marking an index is a
    /// no-op. Returns true only when this call newly recorded the chunk.
    async fn mark_chunk_done(&self, chunk: &UploadChunkRow) -> MetadataResult<bool>;

    /// Number of distinct completed chunks for a session.
    async fn completed_count(&self, user_id: &str, content_hash: &str) -> MetadataResult<u32>;

    /// Add to the session's temp-byte counter (quota pre-check input).
    async fn add_temp_bytes(
        &self,
        user_id: &str,
        content_hash: &str,
        delta: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Delete a session and its chunk rows.
    async fn clear_session(&self, user_id: &str, content_hash: &str) -> MetadataResult<()>;

    /// Sessions past their expiry, oldest first.
    async fn expired_sessions(
        &self,
        now: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<UploadSessionRow>>;
}
