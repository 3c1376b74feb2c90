//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use depot_core::hash::ContentHash;
use depot_core::record::{DeletionState, FileCategory, FileId, FileRecord, FolderKind, LifecycleStatus};
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// File records
// =============================================================================

/// File record row. Enum fields are stored as their string forms; use
/// [`FileRecordRow::into_record`] to get the typed domain value.
#[derive(Debug, Clone, FromRow)]
pub struct FileRecordRow {
    pub file_id: String,
    pub user_id: String,
    pub content_hash: Option<String>,
    pub parent_id: String,
    pub name: String,
    pub path: Option<String>,
    pub size: Option<i64>,
    pub category: String,
    pub folder_kind: String,
    pub lifecycle: String,
    pub deletion: String,
    pub cover: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub recycled_at: Option<OffsetDateTime>,
}

impl FileRecordRow {
    /// Build a row from a domain record.
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            file_id: record.file_id.as_str().to_string(),
            user_id: record.user_id.clone(),
            content_hash: record.content_hash.as_ref().map(|h| h.to_hex()),
            parent_id: record.parent_id.clone(),
            name: record.name.clone(),
            path: record.path.clone(),
            size: record.size,
            category: record.category.as_str().to_string(),
            folder_kind: record.folder_kind.as_str().to_string(),
            lifecycle: record.lifecycle.as_str().to_string(),
            deletion: record.deletion.as_str().to_string(),
            cover: record.cover.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            recycled_at: record.recycled_at,
        }
    }

    /// Convert the row into a typed domain record.
    pub fn into_record(self) -> MetadataResult<FileRecord> {
        let content_hash = match self.content_hash {
            Some(hex) => Some(ContentHash::from_hex(&hex).map_err(|e| {
                MetadataError::Corrupt(format!("file {} content_hash: {e}", self.file_id))
            })?),
            None => None,
        };
        Ok(FileRecord {
            file_id: FileId::new(&self.file_id)
                .map_err(|e| MetadataError::Corrupt(format!("file_id: {e}")))?,
            user_id: self.user_id,
            content_hash,
            parent_id: self.parent_id,
            name: self.name,
            path: self.path,
            size: self.size,
            category: FileCategory::parse(&self.category).ok_or_else(|| {
                MetadataError::Corrupt(format!("file {} category '{}'", self.file_id, self.category))
            })?,
            folder_kind: FolderKind::parse(&self.folder_kind).ok_or_else(|| {
                MetadataError::Corrupt(format!(
                    "file {} folder_kind '{}'",
                    self.file_id, self.folder_kind
                ))
            })?,
            lifecycle: LifecycleStatus::parse(&self.lifecycle).ok_or_else(|| {
                MetadataError::Corrupt(format!(
                    "file {} lifecycle '{}'",
                    self.file_id, self.lifecycle
                ))
            })?,
            deletion: DeletionState::parse(&self.deletion).ok_or_else(|| {
                MetadataError::Corrupt(format!("file {} deletion '{}'", self.file_id, self.deletion))
            })?,
            cover: self.cover,
            created_at: self.created_at,
            updated_at: self.updated_at,
            recycled_at: self.recycled_at,
        })
    }
}

// =============================================================================
// Upload sessions
// =============================================================================

/// Resumable upload session row, keyed by (user_id, content_hash).
#[derive(Debug, Clone, FromRow)]
pub struct UploadSessionRow {
    pub user_id: String,
    pub content_hash: String,
    /// Declared chunk count, fixed at session init.
    pub total_chunks: i64,
    /// Bytes written to the temp dir so far, counted for the quota pre-check.
    pub temp_bytes: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}

/// One completed chunk of an upload session.
#[derive(Debug, Clone, FromRow)]
pub struct UploadChunkRow {
    pub user_id: String,
    pub content_hash: String,
    pub chunk_index: i64,
    pub size_bytes: i64,
    pub received_at: OffsetDateTime,
}

/// Per-account space usage row.
#[derive(Debug, Clone, FromRow)]
pub struct UserSpaceRow {
    pub user_id: String,
    pub used_bytes: i64,
    pub updated_at: OffsetDateTime,
}
