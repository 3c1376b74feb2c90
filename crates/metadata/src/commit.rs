//! Transactional file commit with after-commit hooks.

use crate::models::FileRecordRow;
use depot_core::record::FileRecord;

/// Callback deferred until the commit transaction lands.
pub type AfterCommit = Box<dyn FnOnce() + Send + 'static>;

/// A file commit: the record insert and the owner's space increment applied
/// in one transaction, plus hooks that run only if that transaction commits.
///
/// Hooks run in registration order, after the transaction, outside of it.
/// A failed commit drops them unrun. This is the only place the pipeline
/// defers work across the transaction boundary; nothing fires on rollback.
pub struct FileCommit {
    record: FileRecordRow,
    space_delta: i64,
    hooks: Vec<AfterCommit>,
}

impl FileCommit {
    /// Build a commit for a domain record charging `space_delta` bytes to
    /// its owner.
    pub fn new(record: &FileRecord, space_delta: i64) -> Self {
        Self {
            record: FileRecordRow::from_record(record),
            space_delta,
            hooks: Vec::new(),
        }
    }

    /// Register a hook to run after a successful commit.
    pub fn on_commit(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    /// The row this commit will insert.
    pub fn record(&self) -> &FileRecordRow {
        &self.record
    }

    pub(crate) fn into_parts(self) -> (FileRecordRow, i64, Vec<AfterCommit>) {
        (self.record, self.space_delta, self.hooks)
    }
}

impl std::fmt::Debug for FileCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCommit")
            .field("file_id", &self.record.file_id)
            .field("user_id", &self.record.user_id)
            .field("space_delta", &self.space_delta)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}
