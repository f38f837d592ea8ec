//! The `Coordinator` trait — the only seam that knows how to talk to a
//! concrete coordination store.
//!
//! Everything above this trait (snapshots, entities, watchers) is
//! transport-agnostic: it sees a hierarchical, versioned key tree with
//! compare-and-swap writes and glob-scoped change notification. Two
//! backends ship with this crate: [`MemStore`](crate::MemStore) for tests
//! and embedding, and [`RemoteStore`](crate::RemoteStore) for a networked
//! coordinator.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::event::StoreEvent;

/// Sentinel revision meaning "unconditional" on writes and "current head"
/// on reads.
pub const REV_ANY: i64 = -1;

/// Abstract coordination store: a slash-delimited key tree where every
/// write commits at a new, globally monotonic revision.
///
/// All paths are absolute. Reads taking `Option<i64>` observe the tree as
/// of that revision (`None` means the current head). Writes take the
/// caller's expected revision as a CAS precondition and fail with
/// [`RevMismatch`](crate::StoreError::RevMismatch) if the target was
/// written after it; [`REV_ANY`] disables the check.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Current head revision.
    async fn rev(&self) -> StoreResult<i64>;

    /// Whether anything (a value or a subtree) lives at `path`, and the
    /// revision of the newest write at or under it.
    async fn exists(&self, path: &str, rev: Option<i64>) -> StoreResult<(bool, i64)>;

    /// Value stored at `path`, plus the revision it was written at.
    async fn get(&self, path: &str, rev: Option<i64>) -> StoreResult<(Vec<u8>, i64)>;

    /// Names of the immediate children of the directory at `path`,
    /// sorted ascending.
    async fn getdir(&self, path: &str, rev: i64) -> StoreResult<Vec<String>>;

    /// CAS write of a single value. Returns the commit revision.
    async fn set(&self, path: &str, rev: i64, value: Vec<u8>) -> StoreResult<i64>;

    /// Atomic CAS write of several values under one directory. All keys
    /// commit at the same revision, or none do.
    async fn set_multi(
        &self,
        path: &str,
        values: HashMap<String, Vec<u8>>,
        rev: i64,
    ) -> StoreResult<i64>;

    /// Recursive CAS delete of `path` and everything under it. Returns the
    /// commit revision.
    async fn del(&self, path: &str, rev: i64) -> StoreResult<i64>;

    /// Block until a change at revision >= `rev` matches `glob`, and
    /// return the earliest such change. History is replayed: a change
    /// that already happened satisfies the wait immediately.
    async fn wait(&self, glob: &str, rev: i64) -> StoreResult<StoreEvent>;
}
