//! visor — client library for the global control plane of a
//! process-supervision fleet.
//!
//! All state lives in a strongly-consistent, revision-oriented
//! coordination store (a hierarchical, versioned key tree with watch
//! notifications). This crate models the entity graph persisted there —
//! App → Revision → ProcType → Instance, plus scale records and tickets —
//! and the optimistic-concurrency discipline for mutating it:
//!
//! - Callers acquire a [`Snapshot`] anchored at some revision; every read
//!   and CAS precondition goes through it.
//! - Mutations return a **new** value bound to the post-write revision;
//!   nothing is mutated in place. A lost race surfaces as `RevMismatch`,
//!   and the caller re-reads and retries.
//! - The [`scale`] control loop turns a desired instance count into
//!   start/stop [`Ticket`]s that external agents claim and execute.
//! - [`watch_instance`] and [`watch_ticket`] turn raw store changes into
//!   typed domain events.
//!
//! # Example
//!
//! ```no_run
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> visor::VisorResult<()> {
//!     let snapshot = visor::dial(visor::DEFAULT_ADDR, visor::DEFAULT_ROOT).await?;
//!     let rev = visor::init(&snapshot).await?;
//!     let snapshot = snapshot.fast_forward(rev).await?;
//!
//!     let app = visor::App::new("lolcatapp", "git://cat.git", "cedar", snapshot.clone())
//!         .register()
//!         .await?;
//!
//!     let head = app.path.snapshot.fast_forward(-1).await?;
//!     visor::scale("lolcatapp", "7abcde6", "web", 3, &head).await?;
//!
//!     let (tx, mut rx) = mpsc::channel(16);
//!     tokio::spawn(visor::watch_instance(snapshot, tx));
//!     while let Some(instance) = rx.recv().await {
//!         println!("{}:{} is {}", instance.host, instance.port, instance.state);
//!     }
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use visor_store::{Coordinator, RemoteStore};

pub mod app;
pub mod bootstrap;
pub mod codec;
pub mod error;
pub mod instance;
pub mod path;
pub mod proctype;
pub mod revision;
pub mod scale;
pub mod snapshot;
pub mod ticket;
pub mod watch;

pub use app::{App, apps, get_app};
pub use bootstrap::{START_PORT, claim_next_port, init};
pub use codec::{Codec, IntCodec, JsonCodec, StringCodec};
pub use error::{VisorError, VisorResult};
pub use instance::{
    InsState, Instance, InstanceInfo, get_instance_info, host_instances, instances,
    proc_type_instances,
};
pub use path::{File, Path, get_file, get_latest_file};
pub use proctype::{ProcType, get_proc_type, proc_types};
pub use revision::{Revision, get_revision, revisions};
pub use scale::scale;
pub use snapshot::{Conn, Snapshot, Versioned, fast_forward};
pub use ticket::{Ticket, TicketOp, create_ticket, get_ticket, tickets};
pub use watch::{watch_instance, watch_ticket};

pub use visor_store::{MemStore, StoreError, StoreEvent};

/// Default coordinator address.
pub const DEFAULT_ADDR: &str = "localhost:8046";
/// Default tree root all keys live under.
pub const DEFAULT_ROOT: &str = "/visor";
/// Default proc type name for apps that declare none.
pub const DEFAULT_PROC_NAME: &str = "web";
/// Default deploy type for newly registered apps.
pub const DEPLOY_LXC: &str = "lxc";

/// Connect to the coordinator at `addr` and return a snapshot of the
/// tree under `root` at its current revision.
pub async fn dial(addr: &str, root: &str) -> VisorResult<Snapshot> {
    let store = RemoteStore::connect(addr).await?;
    attach(Arc::new(store), root).await
}

/// Snapshot an already-constructed store backend — in-process
/// [`MemStore`]s, test doubles, or a shared remote connection.
pub async fn attach(store: Arc<dyn Coordinator>, root: &str) -> VisorResult<Snapshot> {
    Snapshot::head(Conn::new(store, root)).await
}

/// Seconds since the Unix epoch; the registration-timestamp format.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_yields_a_head_snapshot() {
        let store = Arc::new(MemStore::new());
        store.set("/elsewhere", -1, b"x".to_vec()).await.unwrap();

        let s = attach(store.clone(), DEFAULT_ROOT).await.unwrap();
        assert_eq!(s.rev, 1);

        let s1 = s.set("greeting", "hola").await.unwrap();
        let (value, _) = store.get("/visor/greeting", None).await.unwrap();
        assert_eq!(value, b"hola");
        assert!(s1.rev > s.rev);
    }
}
