//! Snapshots — revision-anchored handles to the coordination store.
//!
//! A [`Snapshot`] pairs a revision with a [`Conn`]. It is immutable and
//! cheap to clone; every mutation returns a *new* snapshot at the
//! post-write revision, and on failure the caller's snapshot is simply
//! left as it was. All reads and CAS preconditions issued through a
//! snapshot use its revision, so an operation at revision R observes the
//! tree as of R and commits only if nothing it saw has been superseded.

use std::collections::HashMap;
use std::sync::Arc;

use visor_store::{Coordinator, StoreEvent};

use crate::error::{VisorError, VisorResult};

/// Root-scoped, typed handle to a [`Coordinator`] backend.
///
/// The one place that maps library paths (always relative to the
/// configured root) onto absolute store paths. Shared by every snapshot
/// derived from it; safe for concurrent use.
#[derive(Clone)]
pub struct Conn {
    store: Arc<dyn Coordinator>,
    root: Arc<str>,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("root", &self.root).finish()
    }
}

impl Conn {
    /// Wrap a store backend, scoping all operations under `root`.
    pub fn new(store: Arc<dyn Coordinator>, root: &str) -> Self {
        let trimmed = root.trim_end_matches('/');
        let root = if trimmed.is_empty() { "/" } else { trimmed };
        Self {
            store,
            root: Arc::from(root),
        }
    }

    /// Absolute store path for a root-relative one. `"/"` names the root
    /// itself.
    fn abs(&self, path: &str) -> String {
        let rel = path.trim_start_matches('/');
        match (&*self.root, rel) {
            ("/", "") => "/".to_string(),
            ("/", rel) => format!("/{rel}"),
            (root, "") => root.to_string(),
            (root, rel) => format!("{root}/{rel}"),
        }
    }

    /// Root-relative path for an absolute one coming back from the store.
    fn rel(&self, abs: &str) -> String {
        if &*self.root == "/" {
            return abs.to_string();
        }
        match abs.strip_prefix(&*self.root) {
            Some("") => "/".to_string(),
            Some(rest) if rest.starts_with('/') => rest.to_string(),
            _ => abs.to_string(),
        }
    }

    pub async fn rev(&self) -> VisorResult<i64> {
        Ok(self.store.rev().await?)
    }

    pub async fn exists(&self, path: &str, rev: Option<i64>) -> VisorResult<(bool, i64)> {
        Ok(self.store.exists(&self.abs(path), rev).await?)
    }

    pub async fn get(&self, path: &str, rev: Option<i64>) -> VisorResult<(Vec<u8>, i64)> {
        Ok(self.store.get(&self.abs(path), rev).await?)
    }

    pub async fn getdir(&self, path: &str, rev: i64) -> VisorResult<Vec<String>> {
        Ok(self.store.getdir(&self.abs(path), rev).await?)
    }

    pub async fn set(&self, path: &str, rev: i64, value: Vec<u8>) -> VisorResult<i64> {
        Ok(self.store.set(&self.abs(path), rev, value).await?)
    }

    pub async fn set_multi(
        &self,
        path: &str,
        values: HashMap<String, Vec<u8>>,
        rev: i64,
    ) -> VisorResult<i64> {
        Ok(self.store.set_multi(&self.abs(path), values, rev).await?)
    }

    pub async fn del(&self, path: &str, rev: i64) -> VisorResult<i64> {
        Ok(self.store.del(&self.abs(path), rev).await?)
    }

    /// Block until a change at revision >= `rev` matches `glob`. The
    /// returned event's path is root-relative.
    pub async fn wait(&self, glob: &str, rev: i64) -> VisorResult<StoreEvent> {
        let mut event = self.store.wait(&self.abs(glob), rev).await?;
        event.path = self.rel(&event.path);
        Ok(event)
    }
}

/// A revision-anchored view of the store.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub rev: i64,
    pub conn: Conn,
}

impl Snapshot {
    /// Snapshot at the store's current head revision.
    pub async fn head(conn: Conn) -> VisorResult<Self> {
        let rev = conn.rev().await?;
        Ok(Self { rev, conn })
    }

    /// Snapshot at a specific revision. Purely local; no store traffic.
    pub fn at(&self, rev: i64) -> Self {
        Self {
            rev,
            conn: self.conn.clone(),
        }
    }

    /// Snapshot at `rev`, where `-1` means the store's current head.
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<Self> {
        if rev == -1 {
            Ok(self.at(self.conn.rev().await?))
        } else {
            Ok(self.at(rev))
        }
    }

    /// Whether `path` exists as of this snapshot, and the revision of its
    /// last write.
    pub async fn exists(&self, path: &str) -> VisorResult<(bool, i64)> {
        self.conn.exists(path, Some(self.rev)).await
    }

    /// UTF-8 value at `path` as of this snapshot, plus its write revision.
    pub async fn get(&self, path: &str) -> VisorResult<(String, i64)> {
        let (bytes, rev) = self.get_bytes(path).await?;
        let value = String::from_utf8(bytes)
            .map_err(|e| VisorError::BadValue(format!("invalid utf-8 at {path}: {e}")))?;
        Ok((value, rev))
    }

    /// Raw value at `path` as of this snapshot.
    pub async fn get_bytes(&self, path: &str) -> VisorResult<(Vec<u8>, i64)> {
        self.conn.get(path, Some(self.rev)).await
    }

    /// Child names of the directory at `path` as of this snapshot.
    pub async fn getdir(&self, path: &str) -> VisorResult<Vec<String>> {
        self.conn.getdir(path, self.rev).await
    }

    /// CAS write: succeeds only if nothing at `path` was written after
    /// this snapshot's revision. Returns the post-write snapshot.
    pub async fn set(&self, path: &str, value: &str) -> VisorResult<Self> {
        self.set_bytes(path, value.as_bytes().to_vec()).await
    }

    pub async fn set_bytes(&self, path: &str, value: Vec<u8>) -> VisorResult<Self> {
        let rev = self.conn.set(path, self.rev, value).await?;
        Ok(self.at(rev))
    }

    /// Atomic multi-key CAS write under one directory.
    pub async fn set_multi(
        &self,
        path: &str,
        values: HashMap<String, Vec<u8>>,
    ) -> VisorResult<Self> {
        let rev = self.conn.set_multi(path, values, self.rev).await?;
        Ok(self.at(rev))
    }

    /// Set with the extra precondition that `path` already exists as of
    /// this snapshot.
    pub async fn update(&self, path: &str, value: &str) -> VisorResult<Self> {
        // The read doubles as the existence check: NoEnt propagates.
        self.get_bytes(path).await?;
        self.set(path, value).await
    }

    /// Recursive CAS delete of `path` and everything under it.
    pub async fn del(&self, path: &str) -> VisorResult<Self> {
        let rev = self.conn.del(path, self.rev).await?;
        Ok(self.at(rev))
    }

    /// Desired scaling factor for `(app, ref, proctype)` and the revision
    /// it was written at. An absent record reads as 0.
    pub async fn get_scale(
        &self,
        app: &str,
        ref_name: &str,
        proc_name: &str,
    ) -> VisorResult<(i64, i64)> {
        match self.get(&scale_path(app, ref_name, proc_name)).await {
            Ok((value, rev)) => {
                let factor = value.trim().parse().map_err(|_| {
                    VisorError::BadValue(format!("scale record holds {value:?}"))
                })?;
                Ok((factor, rev))
            }
            Err(e) if e.is_noent() => Ok((0, 0)),
            Err(e) => Err(e),
        }
    }

    /// Write the scaling factor for `(app, ref, proctype)`.
    pub async fn set_scale(
        &self,
        app: &str,
        ref_name: &str,
        proc_name: &str,
        factor: i64,
    ) -> VisorResult<Self> {
        self.set(&scale_path(app, ref_name, proc_name), &factor.to_string())
            .await
    }
}

pub(crate) fn scale_path(app: &str, ref_name: &str, proc_name: &str) -> String {
    format!("/scale/{app}/{ref_name}/{proc_name}")
}

/// Capability shared by everything that lives in the store at a revision:
/// rebuild the same value around a different snapshot.
///
/// Gives every entity the same `fast_forward` behaviour through
/// [`fast_forward`].
pub trait Versioned: Sized {
    fn snapshot(&self) -> &Snapshot;

    /// The same entity anchored to `snapshot`.
    fn rebind(&self, snapshot: Snapshot) -> Self;
}

/// Advance any [`Versioned`] value to `rev` (`-1` for the store head).
pub async fn fast_forward<T: Versioned>(entity: &T, rev: i64) -> VisorResult<T> {
    let snapshot = entity.snapshot().fast_forward(rev).await?;
    Ok(entity.rebind(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use visor_store::{MemStore, REV_ANY};

    async fn snapshot() -> Snapshot {
        let conn = Conn::new(Arc::new(MemStore::new()), "/snapshot-test");
        Snapshot::head(conn).await.unwrap()
    }

    #[tokio::test]
    async fn exists_is_anchored_to_the_snapshot_revision() {
        let s = snapshot().await;

        // Write through the connection, bypassing the snapshot.
        let rev = s.conn.set("key", REV_ANY, b"value".to_vec()).await.unwrap();

        let (present, _) = s.exists("key").await.unwrap();
        assert!(!present, "old snapshot must not see the new key");

        let (present, at) = s.at(rev).exists("key").await.unwrap();
        assert!(present);
        assert_eq!(at, rev);
    }

    #[tokio::test]
    async fn set_then_stale_set_reports_rev_mismatch() {
        let s = snapshot().await;

        let s1 = s.set("key", "value").await.unwrap();

        let err = s.get("key").await.unwrap_err();
        assert!(err.is_noent());

        let (value, rev) = s1.get("key").await.unwrap();
        assert_eq!(value, "value");
        assert_eq!(rev, s1.rev);

        // The first write superseded what `s` saw.
        let err = s.set("key", "value").await.unwrap_err();
        assert!(err.is_rev_mismatch());
    }

    #[tokio::test]
    async fn update_requires_existing_key_and_orders_revisions() {
        let s = snapshot().await;
        let s1 = s.set("key", "value").await.unwrap();

        let err = s.update("key", "#").await.unwrap_err();
        assert!(err.is_noent());

        let s2 = s1.update("key", "#").await.unwrap();
        let s3 = s2.update("key", "*").await.unwrap();

        assert_eq!(s2.get("key").await.unwrap().0, "#");
        assert_eq!(s3.get("key").await.unwrap().0, "*");
        assert!(s1.rev < s2.rev && s2.rev < s3.rev);
    }

    #[tokio::test]
    async fn del_removes_subtree_for_later_snapshots() {
        let s = snapshot().await;
        let s1 = s.set("dir/a", "1").await.unwrap();
        let s2 = s1.set("dir/b", "2").await.unwrap();

        // A snapshot that predates part of the subtree cannot delete it.
        let err = s1.del("dir").await.unwrap_err();
        assert!(err.is_rev_mismatch());

        let s3 = s2.del("dir").await.unwrap();
        assert!(s3.get("dir/a").await.unwrap_err().is_noent());
        // The old snapshot still sees its world.
        assert_eq!(s2.get("dir/b").await.unwrap().0, "2");
    }

    #[tokio::test]
    async fn fast_forward_minus_one_reaches_head() {
        let s = snapshot().await;
        let s1 = s.set("a", "1").await.unwrap();
        s1.set("b", "2").await.unwrap();

        let head = s.fast_forward(-1).await.unwrap();
        assert!(head.rev > s1.rev);
        assert_eq!(head.get("b").await.unwrap().0, "2");
    }

    #[tokio::test]
    async fn scale_records_read_as_zero_when_absent() {
        let s = snapshot().await;

        let (factor, rev) = s.get_scale("cat", "7abcde6", "web").await.unwrap();
        assert_eq!((factor, rev), (0, 0));

        let s1 = s.set_scale("cat", "7abcde6", "web", 9).await.unwrap();
        let (factor, _) = s1.get_scale("cat", "7abcde6", "web").await.unwrap();
        assert_eq!(factor, 9);

        let (factor, _) = s1.get_scale("invalid-app", "7abcde6", "web").await.unwrap();
        assert_eq!(factor, 0);
    }

    #[tokio::test]
    async fn conn_paths_are_scoped_under_the_root() {
        let store = Arc::new(MemStore::new());
        let conn = Conn::new(store.clone(), "/visor");
        let s = Snapshot::head(conn).await.unwrap();

        let s1 = s.set("apps/cat/attrs", "{}").await.unwrap();
        let (value, _) = store.get("/visor/apps/cat/attrs", None).await.unwrap();
        assert_eq!(value, b"{}");

        // Deleting "/" tears down the root subtree only.
        let other = Conn::new(store.clone(), "/other");
        Snapshot::head(other.clone())
            .await
            .unwrap()
            .set("kept", "x")
            .await
            .unwrap();
        s1.fast_forward(-1).await.unwrap().del("/").await.unwrap();
        assert!(store.get("/visor/apps/cat/attrs", None).await.unwrap_err().is_noent());
        let (kept, _) = store.get("/other/kept", None).await.unwrap();
        assert_eq!(kept, b"x");
    }
}
