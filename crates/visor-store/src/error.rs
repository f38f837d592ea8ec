//! Error types for the store adapter layer.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a [`Coordinator`](crate::Coordinator) backend.
///
/// `NoEnt` and `RevMismatch` are part of normal control flow — callers
/// recover from them (missing scale records read as zero, allocators retry
/// on lost CAS races). The remaining variants are surfaced unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path names nothing at the requested revision.
    #[error("no entry at {0}")]
    NoEnt(String),

    /// A compare-and-swap precondition failed: the entry was written at a
    /// revision newer than the one the caller presented.
    #[error("revision mismatch at {path}: wrote at {written}, caller saw {seen}")]
    RevMismatch {
        path: String,
        /// Revision of the conflicting write.
        written: i64,
        /// Revision the caller's snapshot presented.
        seen: i64,
    },

    /// The path is not a well-formed slash-delimited key.
    #[error("malformed path {0:?}")]
    BadPath(String),

    /// The underlying connection failed or was torn down mid-request.
    #[error("transport: {0}")]
    Transport(String),

    /// The store handle was closed; no further operations will succeed.
    #[error("store closed")]
    Closed,
}

impl StoreError {
    /// True if this error means the entry simply does not exist.
    pub fn is_noent(&self) -> bool {
        matches!(self, StoreError::NoEnt(_))
    }

    /// True if this error is an optimistic-concurrency conflict.
    pub fn is_rev_mismatch(&self) -> bool {
        matches!(self, StoreError::RevMismatch { .. })
    }
}
