//! Error type shared across the storage and planning layers.

use thiserror::Error;

use crate::storage::Key;

/// Errors that can occur during storage operations.
///
/// Every variant names the failure, not a remedy: nothing in this crate
/// retries or falls back silently, so callers always see the first failing
/// step of a sequence.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The database could not be opened, or its handle is gone.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// An operation named an object store (or index) absent from the
    /// current schema.
    #[error("no object store {0}")]
    StoreNotFound(String),

    /// A point read found nothing at the key.
    #[error("no record at key {0}")]
    NotFound(Key),

    /// A write was rejected by the store.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// A version bump could not run because another open handle still
    /// references the database. The caller must close the competing handle
    /// and retry; the bump is never retried on its own.
    #[error("version change to v{requested} blocked by another open connection")]
    MigrationBlocked { requested: u32 },

    /// The seed template could not be fetched or did not parse. The target
    /// store is left untouched.
    #[error("seed template fetch failed: {0}")]
    SeedFetchFailed(String),

    /// A record could not be converted to or from its stored form.
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
