//! Repository traits for metadata operations.

pub mod files;
pub mod sessions;

pub use files::FileRepo;
pub use sessions::SessionRepo;
