// Error taxonomy for the indexing core

use thiserror::Error;

/// Errors raised by the storage engine.
///
/// `Fatal` is never retried: a lock-wait timeout or disk-level failure
/// usually means a second index process is running against the same
/// database, or the store is corrupted, and reindexing cannot fix either.
/// Everything else that the driver reports is wrapped as `Backend` and
/// left to the caller to skip or abort on.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("fatal storage failure: {0}")]
    Fatal(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("no indexed file for URI `{0}`")]
    FileNotFound(String),

    #[error("no indexed structure with FQCN `{0}`")]
    StructureNotFound(String),
}

impl StorageError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::Fatal(_))
    }

    /// Not-found conditions are expected on the read side (an unopened
    /// file is simply not yet indexed) and must not abort a batch.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::FileNotFound(_) | StorageError::StructureNotFound(_)
        )
    }
}

/// Errors raised while (re)indexing a single file.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The source could not be parsed into a syntax tree. The previously
    /// indexed version of the file is left untouched.
    #[error("could not parse `{uri}`")]
    Parse { uri: String },

    /// A structural assumption was violated while walking the tree. The
    /// file's transaction is rolled back; callers treat this like a parse
    /// failure and continue with the rest of the batch.
    #[error("extraction failed for `{uri}`: {reason}")]
    Extraction { uri: String, reason: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IndexError {
    /// Whether a bulk pass must stop instead of skipping this file.
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndexError::Storage(e) if e.is_fatal())
    }
}
