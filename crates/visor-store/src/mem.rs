//! MemStore — an in-process revisioned key tree.
//!
//! Implements the full [`Coordinator`] contract without a network: MVCC
//! reads at any past revision, CAS writes, recursive CAS deletes, and
//! glob watches with history replay. Every test in the workspace runs
//! against it, and embedders can use it as a single-process coordinator.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::event::{StoreEvent, glob_matches};
use crate::store::{Coordinator, REV_ANY};

/// One write to a single path. A `None` value is a deletion tombstone.
#[derive(Debug, Clone)]
struct Version {
    rev: i64,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct Tree {
    /// Head revision; 0 means no write has ever committed.
    head: i64,
    /// Full version history per path, ascending by revision.
    entries: BTreeMap<String, Vec<Version>>,
    /// Every event ever emitted, ascending by revision. Waits replay
    /// from here, so history is never compacted.
    log: Vec<StoreEvent>,
    closed: bool,
}

impl Tree {
    fn value_at<'a>(&'a self, path: &str, rev: i64) -> Option<&'a Version> {
        let versions = self.entries.get(path)?;
        versions.iter().rev().find(|v| v.rev <= rev)
    }

    fn live_at<'a>(&'a self, path: &str, rev: i64) -> Option<&'a Version> {
        self.value_at(path, rev).filter(|v| v.value.is_some())
    }

    /// Revision of the newest write at `path` across all history, or 0 if
    /// the path was never written.
    fn last_write_rev(&self, path: &str) -> i64 {
        self.entries
            .get(path)
            .and_then(|v| v.last())
            .map_or(0, |v| v.rev)
    }

    /// All paths holding a live value at `rev` that are `path` itself or
    /// fall under it.
    fn live_subtree(&self, path: &str, rev: i64) -> Vec<String> {
        let prefix = subtree_prefix(path);
        let mut live = Vec::new();
        if self.live_at(path, rev).is_some() {
            live.push(path.to_string());
        }
        live.extend(
            self.entries
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .filter(|(k, _)| self.live_at(k, rev).is_some())
                .map(|(k, _)| k.clone()),
        );
        live
    }
}

fn subtree_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn check_path(path: &str) -> StoreResult<()> {
    if path == "/" {
        return Ok(());
    }
    let well_formed = path.starts_with('/')
        && !path.ends_with('/')
        && !path.split('/').skip(1).any(str::is_empty);
    if well_formed {
        Ok(())
    } else {
        Err(StoreError::BadPath(path.to_string()))
    }
}

/// In-memory [`Coordinator`] backend.
pub struct MemStore {
    tree: Mutex<Tree>,
    /// Carries the head revision; bumped on every commit so waiters can
    /// rescan the log.
    committed: watch::Sender<i64>,
}

impl MemStore {
    pub fn new() -> Self {
        let (committed, _) = watch::channel(0);
        Self {
            tree: Mutex::new(Tree::default()),
            committed,
        }
    }

    /// Tear the store down. Blocked waits return
    /// [`StoreError::Closed`], as do all subsequent operations.
    pub fn close(&self) {
        let mut tree = self.tree.lock();
        tree.closed = true;
        let head = tree.head;
        drop(tree);
        let _ = self.committed.send(head);
    }

    fn commit(
        &self,
        tree: &mut Tree,
        writes: Vec<(String, Option<Vec<u8>>)>,
    ) -> i64 {
        tree.head += 1;
        let rev = tree.head;
        for (path, value) in writes {
            tree.entries
                .entry(path.clone())
                .or_default()
                .push(Version {
                    rev,
                    value: value.clone(),
                });
            tree.log.push(StoreEvent { path, body: value, rev });
        }
        let _ = self.committed.send(rev);
        rev
    }

    fn check_open(tree: &Tree) -> StoreResult<()> {
        if tree.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_cas(tree: &Tree, path: &str, rev: i64) -> StoreResult<()> {
        if rev == REV_ANY {
            return Ok(());
        }
        let written = tree.last_write_rev(path);
        if written > rev {
            return Err(StoreError::RevMismatch {
                path: path.to_string(),
                written,
                seen: rev,
            });
        }
        Ok(())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemStore {
    async fn rev(&self) -> StoreResult<i64> {
        let tree = self.tree.lock();
        Self::check_open(&tree)?;
        Ok(tree.head)
    }

    async fn exists(&self, path: &str, rev: Option<i64>) -> StoreResult<(bool, i64)> {
        check_path(path)?;
        let tree = self.tree.lock();
        Self::check_open(&tree)?;
        let rev = rev.unwrap_or(tree.head);
        if let Some(version) = tree.live_at(path, rev) {
            return Ok((true, version.rev));
        }
        let newest = tree
            .live_subtree(path, rev)
            .iter()
            .filter_map(|k| tree.live_at(k, rev))
            .map(|v| v.rev)
            .max();
        match newest {
            Some(r) => Ok((true, r)),
            None => Ok((false, 0)),
        }
    }

    async fn get(&self, path: &str, rev: Option<i64>) -> StoreResult<(Vec<u8>, i64)> {
        check_path(path)?;
        let tree = self.tree.lock();
        Self::check_open(&tree)?;
        let rev = rev.unwrap_or(tree.head);
        match tree.live_at(path, rev) {
            Some(version) => Ok((version.value.clone().unwrap_or_default(), version.rev)),
            None => Err(StoreError::NoEnt(path.to_string())),
        }
    }

    async fn getdir(&self, path: &str, rev: i64) -> StoreResult<Vec<String>> {
        check_path(path)?;
        let tree = self.tree.lock();
        Self::check_open(&tree)?;
        let prefix = subtree_prefix(path);
        let children: BTreeSet<String> = tree
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| tree.live_at(k, rev).is_some())
            .filter_map(|(k, _)| k[prefix.len()..].split('/').next())
            .map(str::to_string)
            .collect();
        if children.is_empty() {
            return Err(StoreError::NoEnt(path.to_string()));
        }
        Ok(children.into_iter().collect())
    }

    async fn set(&self, path: &str, rev: i64, value: Vec<u8>) -> StoreResult<i64> {
        check_path(path)?;
        if path == "/" {
            return Err(StoreError::BadPath(path.to_string()));
        }
        let mut tree = self.tree.lock();
        Self::check_open(&tree)?;
        Self::check_cas(&tree, path, rev)?;
        let committed = self.commit(&mut tree, vec![(path.to_string(), Some(value))]);
        debug!(path, rev = committed, "set");
        Ok(committed)
    }

    async fn set_multi(
        &self,
        path: &str,
        values: HashMap<String, Vec<u8>>,
        rev: i64,
    ) -> StoreResult<i64> {
        check_path(path)?;
        let mut tree = self.tree.lock();
        Self::check_open(&tree)?;
        // Deterministic key order; all-or-nothing CAS check first.
        let mut writes = Vec::with_capacity(values.len());
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        for key in keys {
            if key.is_empty() || key.contains('/') {
                return Err(StoreError::BadPath(format!("{path}/{key}")));
            }
            let full = format!("{path}/{key}");
            Self::check_cas(&tree, &full, rev)?;
            writes.push((full, Some(values[key].clone())));
        }
        let committed = self.commit(&mut tree, writes);
        debug!(path, keys = values.len(), rev = committed, "set multi");
        Ok(committed)
    }

    async fn del(&self, path: &str, rev: i64) -> StoreResult<i64> {
        check_path(path)?;
        let mut tree = self.tree.lock();
        Self::check_open(&tree)?;
        let head = tree.head;
        let doomed = tree.live_subtree(path, head);
        if doomed.is_empty() {
            return Err(StoreError::NoEnt(path.to_string()));
        }
        for key in &doomed {
            Self::check_cas(&tree, key, rev)?;
        }
        let writes = doomed.into_iter().map(|k| (k, None)).collect();
        let committed = self.commit(&mut tree, writes);
        debug!(path, rev = committed, "deleted subtree");
        Ok(committed)
    }

    async fn wait(&self, glob: &str, rev: i64) -> StoreResult<StoreEvent> {
        check_path(glob)?;
        let mut committed = self.committed.subscribe();
        loop {
            {
                let tree = self.tree.lock();
                if let Some(event) = tree
                    .log
                    .iter()
                    .find(|e| e.rev >= rev && glob_matches(glob, &e.path))
                {
                    return Ok(event.clone());
                }
                if tree.closed {
                    return Err(StoreError::Closed);
                }
            }
            if committed.changed().await.is_err() {
                return Err(StoreError::Closed);
            }
        }
    }
}
