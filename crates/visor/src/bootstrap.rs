//! Bootstrap — well-known keys and the global CAS counters.
//!
//! The port allocator hands out TCP ports for new instances from the
//! `/next-port` counter; ticket ids come from `/uid`. Both are single
//! global keys advanced by CAS, so contention resolves by retrying with
//! a short backoff — intended for low-rate allocation.

use std::time::Duration;

use tracing::debug;

use crate::codec::IntCodec;
use crate::error::VisorResult;
use crate::path::{File, get_file};
use crate::snapshot::Snapshot;

/// First port handed out by a freshly initialized tree.
pub const START_PORT: i64 = 8000;

pub(crate) const NEXT_PORT_PATH: &str = "/next-port";
pub(crate) const UID_PATH: &str = "/uid";

const CLAIM_BACKOFF: Duration = Duration::from_millis(100);

/// Idempotently ensure the well-known keys exist, seeding the port
/// allocator at [`START_PORT`]. Returns the revision the tree is known
/// good at.
///
/// The `/next-port` key doubles as the initialization sentinel: if an
/// operator deletes it by hand, a re-run reseeds the counter and already
/// handed-out ports can be allocated again.
pub async fn init(snapshot: &Snapshot) -> VisorResult<i64> {
    let (exists, _) = snapshot.conn.exists(NEXT_PORT_PATH, None).await?;
    if exists {
        return snapshot.conn.rev().await;
    }
    let done = snapshot.set(NEXT_PORT_PATH, &START_PORT.to_string()).await?;
    debug!(rev = done.rev, "seeded port allocator");
    Ok(done.rev)
}

/// Allocate the next free instance port.
///
/// Requires [`init`] to have run; an uninitialized tree reports `NoEnt`.
pub async fn claim_next_port(snapshot: &Snapshot) -> VisorResult<i64> {
    claim_counter(snapshot, NEXT_PORT_PATH, None).await
}

/// Allocate the next ticket id, lazily seeding `/uid` on first use.
pub(crate) async fn claim_uid(snapshot: &Snapshot) -> VisorResult<i64> {
    claim_counter(snapshot, UID_PATH, Some(1)).await
}

/// Read-increment a counter key under CAS, retrying lost races.
///
/// The stored value is the next unallocated number; the winner of the
/// CAS gets that number and leaves its successor behind. With `seed`,
/// a missing key is created on first use; without it, `NoEnt` surfaces.
async fn claim_counter(
    snapshot: &Snapshot,
    path: &str,
    seed: Option<i64>,
) -> VisorResult<i64> {
    loop {
        let head = snapshot.fast_forward(-1).await?;
        let file = match get_file(&head, path, IntCodec).await {
            Ok(file) => file,
            Err(e) if e.is_noent() && seed.is_some() => {
                let start = seed.unwrap_or_default();
                let created = File::new(head, path.to_string(), IntCodec, start + 1)
                    .create()
                    .await;
                match created {
                    Ok(_) => return Ok(start),
                    Err(e) if e.is_key_conflict() || e.is_rev_mismatch() => {
                        tokio::time::sleep(CLAIM_BACKOFF).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };

        let claimed = file.value;
        match file.set(claimed + 1).await {
            Ok(_) => return Ok(claimed),
            Err(e) if e.is_rev_mismatch() => tokio::time::sleep(CLAIM_BACKOFF).await,
            Err(e) => return Err(e),
        }
    }
}
