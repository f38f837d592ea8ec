//! The scaling control loop.
//!
//! Reconciles a desired scaling factor with the current one by writing
//! the scale record and emitting one start or stop ticket per unit of
//! difference. The whole loop runs against one logical snapshot; every
//! write is individually CAS-protected, so of two racing scalers exactly
//! one advances the scale record and the loser sees `RevMismatch` and
//! must re-read and retry.

use tracing::info;

use crate::error::{VisorError, VisorResult};
use crate::proctype::proc_type_dir;
use crate::revision::revision_dir;
use crate::snapshot::Snapshot;
use crate::ticket::{TicketOp, create_ticket};

/// Set the desired instance count for `(app, ref, proctype)` to
/// `factor`, creating the tickets that realize the change.
///
/// Both the revision and the proc type must be registered. Returns the
/// snapshot after the last write, so callers can continue from a
/// consistent view.
pub async fn scale(
    app: &str,
    ref_name: &str,
    proc_name: &str,
    factor: i64,
    snapshot: &Snapshot,
) -> VisorResult<Snapshot> {
    if factor < 0 {
        return Err(VisorError::BadValue(
            "scaling factor must not be negative".to_string(),
        ));
    }

    let conn = &snapshot.conn;
    let (exists, _) = conn.exists(&revision_dir(app, ref_name), None).await?;
    if !exists {
        return Err(VisorError::NotFound(format!("{app}@{ref_name}")));
    }
    let (exists, _) = conn.exists(&proc_type_dir(app, proc_name), None).await?;
    if !exists {
        return Err(VisorError::NotFound(format!("proc '{proc_name}'")));
    }

    let (current, _) = snapshot.get_scale(app, ref_name, proc_name).await?;
    let delta = factor - current;
    let (op, count) = if delta >= 0 {
        (TicketOp::Start, delta)
    } else {
        (TicketOp::Stop, -delta)
    };

    let mut snapshot = snapshot
        .set_scale(app, ref_name, proc_name, factor)
        .await?;

    for _ in 0..count {
        let ticket = create_ticket(app, ref_name, proc_name, op, &snapshot).await?;
        // Continue from the ticket's revision so later writes in this
        // loop see everything already committed.
        snapshot = ticket.path.snapshot.clone();
    }

    info!(app, ref_name, proc_name, from = current, to = factor, tickets = count, "scaled");
    Ok(snapshot)
}
