//! visor-store — coordination-store adapter layer.
//!
//! A hierarchical, versioned key tree with compare-and-swap writes and
//! glob-scoped change notification, behind the object-safe [`Coordinator`]
//! trait. Every write commits at a new globally monotonic revision; reads
//! observe the tree as of any revision.
//!
//! Two backends:
//!
//! - [`MemStore`] — complete in-process implementation (MVCC history,
//!   recursive CAS deletes, watch replay). Used by the workspace's tests
//!   and usable as a single-process coordinator.
//! - [`RemoteStore`] — TCP client speaking newline-delimited JSON frames
//!   to a networked coordinator.

pub mod error;
pub mod event;
pub mod mem;
pub mod remote;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use event::{StoreEvent, glob_matches};
pub use mem::MemStore;
pub use remote::RemoteStore;
pub use store::{Coordinator, REV_ANY};
