//! Watchers — long-running subscriptions that turn raw store changes
//! into typed domain events.
//!
//! Each watcher blocks on the store's `wait`, hydrates the entity behind
//! the event at the event's revision, and pushes it into the caller's
//! channel. Hydration failures are logged and skipped so one torn write
//! cannot stall the stream; the loop ends when the consumer drops its
//! receiver or the underlying connection is lost.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::VisorResult;
use crate::instance::{InstanceInfo, get_instance_info};
use crate::snapshot::Snapshot;
use crate::ticket::{Ticket, get_ticket};

const INSTANCE_REGISTRATION_GLOB: &str = "/apps/*/revs/*/procs/*/instances/*/registered";
const TICKET_OP_GLOB: &str = "/tickets/*/op";

/// Stream every instance registration after the snapshot's revision into
/// `listener`.
///
/// Returns `Ok(())` when the listener is dropped, and the transport
/// error if the connection dies. Deletions under the watched keys are
/// skipped.
pub async fn watch_instance(
    snapshot: Snapshot,
    listener: mpsc::Sender<InstanceInfo>,
) -> VisorResult<()> {
    let mut rev = snapshot.rev;
    loop {
        let event = snapshot.conn.wait(INSTANCE_REGISTRATION_GLOB, rev + 1).await?;
        rev = event.rev;
        if !event.is_set() {
            continue;
        }

        let Some((app, ref_name, proc_name, id)) = parse_instance_path(&event.path) else {
            continue;
        };

        let at = snapshot.at(event.rev);
        let info = match get_instance_info(&at, app, ref_name, proc_name, id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(path = %event.path, rev = event.rev, error = %e, "skipping unhydratable instance event");
                continue;
            }
        };

        if listener.send(info).await.is_err() {
            info!("instance watcher shut down");
            return Ok(());
        }
    }
}

/// Stream every ticket created after the snapshot's revision into
/// `listener`. Same termination and skip semantics as
/// [`watch_instance`].
pub async fn watch_ticket(snapshot: Snapshot, listener: mpsc::Sender<Ticket>) -> VisorResult<()> {
    let mut rev = snapshot.rev;
    loop {
        let event = snapshot.conn.wait(TICKET_OP_GLOB, rev + 1).await?;
        rev = event.rev;
        if !event.is_set() {
            continue;
        }

        let Some(id) = parse_ticket_path(&event.path) else {
            continue;
        };

        let at = snapshot.at(event.rev);
        let ticket = match get_ticket(&at, id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(path = %event.path, rev = event.rev, error = %e, "skipping unhydratable ticket event");
                continue;
            }
        };

        if listener.send(ticket).await.is_err() {
            info!("ticket watcher shut down");
            return Ok(());
        }
    }
}

fn parse_instance_path(path: &str) -> Option<(&str, &str, &str, &str)> {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", "apps", app, "revs", ref_name, "procs", proc_name, "instances", id, "registered"] => {
            Some((app, ref_name, proc_name, id))
        }
        _ => None,
    }
}

fn parse_ticket_path(path: &str) -> Option<i64> {
    let parts: Vec<&str> = path.split('/').collect();
    match parts.as_slice() {
        ["", "tickets", id, "op"] => id.parse().ok(),
        _ => None,
    }
}
