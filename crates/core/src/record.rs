//! File records: the canonical metadata for every file and folder node.

use crate::hash::ContentHash;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Extensions that are never accepted for upload, checked on the first chunk.
const BLOCKED_SUFFIXES: &[&str] = &[
    "exe", "bat", "cmd", "com", "msi", "scr", "ps1", "vbs", "sh", "jar",
];

/// An opaque, user-scoped file identifier.
///
/// Generated ids are short random alphanumeric strings; ids arriving from
/// callers are validated so they stay safe to embed in storage keys.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        let id: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(crate::FILE_ID_LEN)
            .map(char::from)
            .collect();
        Self(id)
    }

    /// Validate and wrap an id supplied by a caller.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 64 {
            return Err(crate::Error::InvalidFileId(format!(
                "length {} out of range 1..=64",
                id.len()
            )));
        }
        if !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(crate::Error::InvalidFileId(
                "must be ascii alphanumeric".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a record is a file or a folder node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    File,
    Folder,
}

impl FolderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "folder" => Some(Self::Folder),
            _ => None,
        }
    }
}

/// Transfer lifecycle of a file record.
///
/// Records are created `Transferring` at commit; the transcode pipeline
/// promotes them to `Active` on success or `TransferFailed` on error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Transferring,
    Active,
    TransferFailed,
}

impl LifecycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transferring => "transferring",
            Self::Active => "active",
            Self::TransferFailed => "transfer_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transferring" => Some(Self::Transferring),
            "active" => Some(Self::Active),
            "transfer_failed" => Some(Self::TransferFailed),
            _ => None,
        }
    }
}

/// Deletion state of a record. Transitions Active -> Recycled -> Purged;
/// each step asynchronously cleans backend objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionState {
    Active,
    Recycled,
    Purged,
}

impl DeletionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Recycled => "recycled",
            Self::Purged => "purged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "recycled" => Some(Self::Recycled),
            "purged" => Some(Self::Purged),
            _ => None,
        }
    }
}

/// Coarse file category derived from the name suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Video,
    Audio,
    Image,
    Document,
    Other,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Image => "image",
            Self::Document => "document",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "image" => Some(Self::Image),
            "document" => Some(Self::Document),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// Derive the category from a file name suffix (without the dot).
    pub fn from_suffix(suffix: &str) -> Self {
        match suffix.to_ascii_lowercase().as_str() {
            "mp4" | "avi" | "rmvb" | "mkv" | "mov" | "webm" | "ts" | "m3u8" => Self::Video,
            "mp3" | "wav" | "wma" | "flac" | "ape" | "aac" | "ogg" => Self::Audio,
            "jpeg" | "jpg" | "png" | "gif" | "bmp" | "webp" | "svg" | "tiff" | "psd" => Self::Image,
            "pdf" | "doc" | "docx" | "xls" | "xlsx" | "ppt" | "pptx" | "txt" | "md" => {
                Self::Document
            }
            _ => Self::Other,
        }
    }
}

/// Extract the suffix (extension, without the dot) from a file name.
pub fn file_suffix(name: &str) -> Option<&str> {
    let idx = name.rfind('.')?;
    let suffix = &name[idx + 1..];
    if suffix.is_empty() { None } else { Some(suffix) }
}

/// Whether the suffix is on the blocked (executable) list.
pub fn suffix_blocked(suffix: &str) -> bool {
    let lower = suffix.to_ascii_lowercase();
    BLOCKED_SUFFIXES.contains(&lower.as_str())
}

/// Rename `name` by appending a short random tag before the suffix.
/// Used when a commit would collide with an existing name in the folder.
pub fn rename_with_suffix(name: &str) -> String {
    let tag: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    match name.rfind('.') {
        Some(idx) => format!("{}_{}{}", &name[..idx], tag, &name[idx..]),
        None => format!("{name}_{tag}"),
    }
}

/// Canonical metadata for one file or folder node.
///
/// Owned by the metadata store; the cache holds non-owning, time-bounded
/// copies keyed by `(file_id, user_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub user_id: String,
    /// Dedup identity. Nullable once the record only references shared
    /// storage, so purging the source never orphans the pointer.
    pub content_hash: Option<ContentHash>,
    /// Tree edge; `"0"` is the root.
    pub parent_id: String,
    pub name: String,
    /// Storage backend key. None for folders.
    pub path: Option<String>,
    pub size: Option<i64>,
    pub category: FileCategory,
    pub folder_kind: FolderKind,
    pub lifecycle: LifecycleStatus,
    pub deletion: DeletionState,
    /// Cover image key produced by the transcode pipeline.
    pub cover: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Set when the record enters the recycle bin.
    pub recycled_at: Option<OffsetDateTime>,
}

impl FileRecord {
    /// Build a new file node in the `Transferring` state.
    pub fn new_file(
        user_id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
        content_hash: ContentHash,
        path: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let category = file_suffix(&name)
            .map(FileCategory::from_suffix)
            .unwrap_or(FileCategory::Other);
        let now = OffsetDateTime::now_utc();
        Self {
            file_id: FileId::generate(),
            user_id: user_id.into(),
            content_hash: Some(content_hash),
            parent_id: parent_id.into(),
            name,
            path: Some(path.into()),
            size: None,
            category,
            folder_kind: FolderKind::File,
            lifecycle: LifecycleStatus::Transferring,
            deletion: DeletionState::Active,
            cover: None,
            created_at: now,
            updated_at: now,
            recycled_at: None,
        }
    }

    /// Build a new folder node.
    pub fn new_folder(
        user_id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            file_id: FileId::generate(),
            user_id: user_id.into(),
            content_hash: None,
            parent_id: parent_id.into(),
            name: name.into(),
            path: None,
            size: None,
            category: FileCategory::Other,
            folder_kind: FolderKind::Folder,
            lifecycle: LifecycleStatus::Active,
            deletion: DeletionState::Active,
            cover: None,
            created_at: now,
            updated_at: now,
            recycled_at: None,
        }
    }

    /// Check the structural invariants of the record.
    ///
    /// A folder never carries a hash or storage path; an active file always
    /// has both a path and a size.
    pub fn validate(&self) -> crate::Result<()> {
        match self.folder_kind {
            FolderKind::Folder => {
                if self.content_hash.is_some() || self.path.is_some() {
                    return Err(crate::Error::InvalidRecord(format!(
                        "folder {} carries content hash or path",
                        self.file_id
                    )));
                }
            }
            FolderKind::File => {
                if self.lifecycle == LifecycleStatus::Active
                    && (self.path.is_none() || self.size.is_none())
                {
                    return Err(crate::Error::InvalidRecord(format!(
                        "active file {} missing path or size",
                        self.file_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_generate_shape() {
        let id = FileId::generate();
        assert_eq!(id.as_str().len(), crate::FILE_ID_LEN);
        assert!(id.as_str().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_file_id_rejects_separators() {
        assert!(FileId::new("ok12345678").is_ok());
        assert!(FileId::new("../escape").is_err());
        assert!(FileId::new("").is_err());
    }

    #[test]
    fn test_category_from_suffix() {
        assert_eq!(FileCategory::from_suffix("mp4"), FileCategory::Video);
        assert_eq!(FileCategory::from_suffix("JPG"), FileCategory::Image);
        assert_eq!(FileCategory::from_suffix("flac"), FileCategory::Audio);
        assert_eq!(FileCategory::from_suffix("docx"), FileCategory::Document);
        assert_eq!(FileCategory::from_suffix("xyz"), FileCategory::Other);
    }

    #[test]
    fn test_suffix_helpers() {
        assert_eq!(file_suffix("movie.tar.gz"), Some("gz"));
        assert_eq!(file_suffix("noext"), None);
        assert_eq!(file_suffix("trailing."), None);
        assert!(suffix_blocked("EXE"));
        assert!(!suffix_blocked("png"));
    }

    #[test]
    fn test_rename_keeps_suffix() {
        let renamed = rename_with_suffix("report.pdf");
        assert!(renamed.starts_with("report_"));
        assert!(renamed.ends_with(".pdf"));
        assert_ne!(renamed, "report.pdf");

        let bare = rename_with_suffix("folder");
        assert!(bare.starts_with("folder_"));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            LifecycleStatus::Transferring,
            LifecycleStatus::Active,
            LifecycleStatus::TransferFailed,
        ] {
            assert_eq!(LifecycleStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LifecycleStatus::parse("bogus"), None);
    }

    #[test]
    fn test_folder_invariant() {
        let mut folder = FileRecord::new_folder("u1", crate::ROOT_PARENT_ID, "docs");
        assert!(folder.validate().is_ok());
        folder.path = Some("files/x".to_string());
        assert!(folder.validate().is_err());
    }

    #[test]
    fn test_active_file_invariant() {
        let hash = ContentHash::compute(b"data");
        let mut file = FileRecord::new_file("u1", "0", "a.txt", hash, "202608/a.txt");
        assert!(file.validate().is_ok());

        file.lifecycle = LifecycleStatus::Active;
        assert!(file.validate().is_err(), "active file without size");

        file.size = Some(4);
        assert!(file.validate().is_ok());
    }
}
