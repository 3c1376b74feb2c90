//! File record repository.

use crate::error::MetadataResult;
use crate::models::FileRecordRow;
use async_trait::async_trait;
use depot_core::record::LifecycleStatus;
use time::OffsetDateTime;

/// Repository for file record operations.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Insert a new file record.
    async fn insert_file(&self, record: &FileRecordRow) -> MetadataResult<()>;

    /// Get a file record by id, scoped to its owner.
    async fn get_file(&self, user_id: &str, file_id: &str) -> MetadataResult<Option<FileRecordRow>>;

    /// Find a usable record carrying this content hash, across all users.
    /// Returns the oldest active, non-deleted match; the dedup path
    /// references its storage objects instead of uploading again.
    async fn find_active_by_hash(
        &self,
        content_hash: &str,
    ) -> MetadataResult<Option<FileRecordRow>>;

    /// Whether a non-deleted record with this name already exists in the
    /// folder. Drives auto-rename at commit.
    async fn name_exists(
        &self,
        user_id: &str,
        parent_id: &str,
        name: &str,
    ) -> MetadataResult<bool>;

    /// Settle a transfer: set the final lifecycle plus size and cover.
    /// Guarded on the record still being `Transferring`; returns false if
    /// someone settled it first, and the update is skipped entirely.
    async fn finish_transfer(
        &self,
        user_id: &str,
        file_id: &str,
        status: LifecycleStatus,
        size: Option<i64>,
        cover: Option<&str>,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Move an active record into the recycle bin.
    /// Returns false if the record was not in the `Active` deletion state.
    async fn recycle_file(
        &self,
        user_id: &str,
        file_id: &str,
        recycled_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Recycled records whose `recycled_at` is before the cutoff, oldest
    /// first. The purge sweep consumes these in batches.
    async fn recycled_before(
        &self,
        cutoff: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<FileRecordRow>>;

    /// Mark a recycled record purged. Returns false if it was not recycled.
    async fn mark_purged(
        &self,
        user_id: &str,
        file_id: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Number of non-purged records still carrying this content hash.
    /// The purge sweep deletes the shared storage object only at zero.
    async fn hash_reference_count(&self, content_hash: &str) -> MetadataResult<i64>;

    /// All distinct content hashes of non-purged records. Used to warm the
    /// dedup filter at startup.
    async fn active_hashes(&self) -> MetadataResult<Vec<String>>;

    /// Bytes currently charged to an account.
    async fn used_space(&self, user_id: &str) -> MetadataResult<i64>;

    /// Adjust an account's used space by `delta` (may be negative; floors
    /// at zero).
    async fn add_used_space(
        &self,
        user_id: &str,
        delta: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;
}
