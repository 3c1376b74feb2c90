//! Core domain types and shared logic for the Depot storage pipeline.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes for dedup identity
//! - File records and their lifecycle states
//! - File categories and name handling
//! - Application configuration

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod record;

pub use config::AppConfig;
pub use context::RequestContext;
pub use error::{Error, Result};
pub use hash::ContentHash;
pub use record::{
    DeletionState, FileCategory, FileId, FileRecord, FolderKind, LifecycleStatus, file_suffix,
    rename_with_suffix, suffix_blocked,
};

/// Parent id of the virtual root folder.
pub const ROOT_PARENT_ID: &str = "0";

/// Length of generated file ids.
pub const FILE_ID_LEN: usize = 10;

/// Copy window for sequential chunk transfer: 8 MiB
pub const COPY_WINDOW_SIZE: usize = 8 * 1024 * 1024;

/// Maximum chunks a single upload session may declare.
pub const MAX_CHUNKS_PER_UPLOAD: u32 = 10_000;
