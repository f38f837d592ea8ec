//! Error types for the visor client library.

use thiserror::Error;
use visor_store::StoreError;

/// Result type alias for library operations.
pub type VisorResult<T> = Result<T, VisorError>;

/// Errors surfaced by the client library.
///
/// Store-level failures (`NoEnt`, `RevMismatch`, transport loss) pass
/// through unchanged inside the `Store` variant; the remaining variants
/// originate in this crate. Every kind is distinguishable by predicate
/// and none overlap.
#[derive(Debug, Error)]
pub enum VisorError {
    /// Attempt to create a key that already exists. Never recovered here;
    /// the caller decides whether to unregister first or ignore.
    #[error("key is already set")]
    KeyConflict,

    /// Illegal lifecycle transition, e.g. registering an instance whose
    /// state is not `Initial`.
    #[error("invalid state")]
    InvalidState,

    /// A stored value failed to decode, or an input value cannot be
    /// stored. Indicates schema corruption or drift; treated as fatal.
    #[error("bad value: {0}")]
    BadValue(String),

    /// Reserved. No operation currently returns it.
    #[error("operation is not permitted")]
    Unauthorized,

    /// A named entity the operation depends on is not registered.
    #[error("{0} not found")]
    NotFound(String),

    /// Error reported by the coordination store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl VisorError {
    /// True if the error means a key was simply absent.
    pub fn is_noent(&self) -> bool {
        matches!(self, VisorError::Store(e) if e.is_noent())
    }

    /// True if a CAS precondition failed — the optimistic-concurrency
    /// signal. Re-fetch a fresh snapshot and retry.
    pub fn is_rev_mismatch(&self) -> bool {
        matches!(self, VisorError::Store(e) if e.is_rev_mismatch())
    }

    /// True if a create hit an already-existing key.
    pub fn is_key_conflict(&self) -> bool {
        matches!(self, VisorError::KeyConflict)
    }

    /// True if an entity lifecycle transition was rejected.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, VisorError::InvalidState)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_do_not_overlap() {
        let errors = [
            VisorError::KeyConflict,
            VisorError::InvalidState,
            VisorError::Store(StoreError::NoEnt("/x".into())),
            VisorError::Store(StoreError::RevMismatch {
                path: "/x".into(),
                written: 2,
                seen: 1,
            }),
        ];
        let hits: Vec<usize> = errors
            .iter()
            .map(|e| {
                [
                    e.is_key_conflict(),
                    e.is_invalid_state(),
                    e.is_noent(),
                    e.is_rev_mismatch(),
                ]
                .iter()
                .filter(|b| **b)
                .count()
            })
            .collect();
        assert_eq!(hits, vec![1, 1, 1, 1]);
    }
}
