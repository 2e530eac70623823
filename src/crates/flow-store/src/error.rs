//! Error types shared by the cache and blob repository traits.

use thiserror::Error;

/// Convenience result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors returned by [`crate::CacheRepo`] and [`crate::BlobRepo`] implementations.
///
/// Callers in `flow-core` treat every variant here as non-fatal: a cache or blob
/// failure degrades to a miss/no-op rather than aborting the flow (see the engine's
/// error handling design, which never lets a storage backend hiccup kill a run).
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}
