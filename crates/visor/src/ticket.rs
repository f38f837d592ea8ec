//! Tickets — units of scaling work consumed by external agents.
//!
//! A ticket names its target `(app, ref, proctype)` and an operation, and
//! moves through `unclaimed → claimed → done`. Claiming is a CAS create
//! of the `claimed` key, so exactly one agent wins; `done` removes the
//! ticket subtree.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bootstrap::claim_uid;
use crate::codec::{Codec, JsonCodec};
use crate::error::{VisorError, VisorResult};
use crate::path::{Path, get_file};
use crate::snapshot::{Snapshot, Versioned};

pub(crate) const TICKETS_DIR: &str = "/tickets";

fn ticket_dir(id: i64) -> String {
    format!("{TICKETS_DIR}/{id}")
}

/// What an agent should do with the target proc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketOp {
    Start,
    Stop,
}

impl TicketOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketOp::Start => "start",
            TicketOp::Stop => "stop",
        }
    }

    fn parse(value: &str) -> VisorResult<Self> {
        match value {
            "start" => Ok(TicketOp::Start),
            "stop" => Ok(TicketOp::Stop),
            other => Err(VisorError::BadValue(format!(
                "unknown ticket operation {other:?}"
            ))),
        }
    }
}

impl fmt::Display for TicketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted target of a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TicketAttrs {
    app: String,
    rev: String,
    proctype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<String>,
}

/// A scaling work item.
#[derive(Clone, Debug)]
pub struct Ticket {
    pub id: i64,
    pub path: Path,
    pub app_name: String,
    pub ref_name: String,
    pub proc_name: String,
    pub op: TicketOp,
    /// Address of the target instance, for stop work aimed at a specific
    /// process.
    pub addr: Option<String>,
    /// `host:pid` of the agent holding the claim, if any.
    pub claimed: Option<String>,
}

impl Ticket {
    /// Advance the ticket to `rev` (`-1` for the store head).
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<Ticket> {
        crate::snapshot::fast_forward(self, rev).await
    }

    /// Claim the ticket as `claimer` (`host:pid`). Fails with
    /// [`KeyConflict`](VisorError::KeyConflict) if an agent already holds
    /// it; a lost race surfaces as
    /// [`RevMismatch`](visor_store::StoreError::RevMismatch).
    pub async fn claim(&self, claimer: &str) -> VisorResult<Ticket> {
        let path = self.path.prefix("claimed");
        let (exists, _) = self.snapshot().conn.exists(&path, None).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }

        let snapshot = self.snapshot().set(&path, claimer).await?;
        debug!(ticket = self.id, claimer, "ticket claimed");
        let mut ticket = self.rebind(snapshot);
        ticket.claimed = Some(claimer.to_string());
        Ok(ticket)
    }

    /// Release the claim, making the ticket available again.
    pub async fn unclaim(&self) -> VisorResult<Ticket> {
        let snapshot = self.snapshot().del(&self.path.prefix("claimed")).await?;
        debug!(ticket = self.id, "ticket unclaimed");
        let mut ticket = self.rebind(snapshot);
        ticket.claimed = None;
        Ok(ticket)
    }

    /// Mark the work complete by removing the ticket subtree.
    pub async fn done(&self) -> VisorResult<()> {
        self.snapshot().del(&self.path.prefix("/")).await?;
        debug!(ticket = self.id, "ticket done");
        Ok(())
    }
}

impl Versioned for Ticket {
    fn snapshot(&self) -> &Snapshot {
        &self.path.snapshot
    }

    fn rebind(&self, snapshot: Snapshot) -> Self {
        let mut ticket = self.clone();
        ticket.path = Path::new(snapshot, ticket.path.dir.clone());
        ticket
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ticket<{}> {} {}@{}#{}",
            self.id, self.op, self.app_name, self.ref_name, self.proc_name
        )
    }
}

/// Create a ticket targeting `(app, ref, proctype)`.
///
/// The id comes from the global allocator; the operation and target
/// commit atomically, so watchers never observe a half-written ticket.
pub async fn create_ticket(
    app: &str,
    ref_name: &str,
    proc_name: &str,
    op: TicketOp,
    snapshot: &Snapshot,
) -> VisorResult<Ticket> {
    let id = claim_uid(snapshot).await?;
    let dir = ticket_dir(id);

    let attrs = TicketAttrs {
        app: app.to_string(),
        rev: ref_name.to_string(),
        proctype: proc_name.to_string(),
        addr: None,
    };
    let codec: JsonCodec<TicketAttrs> = JsonCodec::new();
    let values = HashMap::from([
        ("op".to_string(), op.as_str().as_bytes().to_vec()),
        ("attrs".to_string(), codec.encode(&attrs)?),
    ]);
    let done = snapshot.set_multi(&dir, values).await?;

    debug!(ticket = id, %op, app, ref_name, proc_name, "ticket created");
    Ok(Ticket {
        id,
        path: Path::new(done, dir),
        app_name: app.to_string(),
        ref_name: ref_name.to_string(),
        proc_name: proc_name.to_string(),
        op,
        addr: None,
        claimed: None,
    })
}

/// Fetch a ticket by id, as of the given snapshot.
pub async fn get_ticket(snapshot: &Snapshot, id: i64) -> VisorResult<Ticket> {
    let dir = ticket_dir(id);

    let (op, _) = snapshot.get(&format!("{dir}/op")).await?;
    let op = TicketOp::parse(&op)?;

    let attrs = get_file::<JsonCodec<TicketAttrs>>(
        snapshot,
        &format!("{dir}/attrs"),
        JsonCodec::new(),
    )
    .await?
    .value;

    let claimed = match snapshot.get(&format!("{dir}/claimed")).await {
        Ok((claimer, _)) => Some(claimer),
        Err(e) if e.is_noent() => None,
        Err(e) => return Err(e),
    };

    Ok(Ticket {
        id,
        path: Path::new(snapshot.clone(), dir),
        app_name: attrs.app,
        ref_name: attrs.rev,
        proc_name: attrs.proctype,
        op,
        addr: attrs.addr,
        claimed,
    })
}

/// All outstanding tickets, at the store's head revision, ascending by id.
pub async fn tickets(snapshot: &Snapshot) -> VisorResult<Vec<Ticket>> {
    let head = snapshot.fast_forward(-1).await?;
    let names = match head.getdir(TICKETS_DIR).await {
        Ok(names) => names,
        Err(e) if e.is_noent() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut all = Vec::new();
    for name in names {
        let Ok(id) = name.parse::<i64>() else { continue };
        match get_ticket(&head, id).await {
            Ok(ticket) => all.push(ticket),
            Err(e) if e.is_noent() => continue,
            Err(e) => return Err(e),
        }
    }
    all.sort_by_key(|t| t.id);
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Conn;
    use crate::{DEFAULT_ROOT, init};
    use std::sync::Arc;
    use visor_store::MemStore;

    async fn ticket_setup() -> Snapshot {
        let conn = Conn::new(Arc::new(MemStore::new()), DEFAULT_ROOT);
        let s = Snapshot::head(conn).await.unwrap();
        let rev = init(&s).await.unwrap();
        s.fast_forward(rev).await.unwrap()
    }

    #[tokio::test]
    async fn create_assigns_distinct_ids_atomically() {
        let s = ticket_setup().await;

        let first = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &s)
            .await
            .unwrap();
        let s = first.snapshot().clone();
        let second = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &s)
            .await
            .unwrap();
        assert_ne!(first.id, second.id);

        // op and attrs committed at one revision.
        let head = second.snapshot();
        let (_, op_rev) = head.get(&second.path.prefix("op")).await.unwrap();
        let (_, attrs_rev) = head.get(&second.path.prefix("attrs")).await.unwrap();
        assert_eq!(op_rev, attrs_rev);
    }

    #[tokio::test]
    async fn get_ticket_round_trips() {
        let s = ticket_setup().await;
        let created = create_ticket("cat", "7abcde6", "web", TicketOp::Stop, &s)
            .await
            .unwrap();

        let fetched = get_ticket(created.snapshot(), created.id).await.unwrap();
        assert_eq!(fetched.app_name, "cat");
        assert_eq!(fetched.ref_name, "7abcde6");
        assert_eq!(fetched.proc_name, "web");
        assert_eq!(fetched.op, TicketOp::Stop);
        assert_eq!(fetched.addr, None);
        assert_eq!(fetched.claimed, None);
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let s = ticket_setup().await;
        let ticket = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &s)
            .await
            .unwrap();

        let claimed = ticket.claim("worker1:4242").await.unwrap();
        assert_eq!(claimed.claimed.as_deref(), Some("worker1:4242"));

        // Later agents see the existing claim, stale snapshot or not.
        let fresh = claimed.fast_forward(-1).await.unwrap();
        assert!(fresh.claim("worker2:4243").await.unwrap_err().is_key_conflict());
        assert!(ticket.claim("worker3:4244").await.unwrap_err().is_key_conflict());
    }

    #[tokio::test]
    async fn unclaim_reopens_the_ticket() {
        let s = ticket_setup().await;
        let ticket = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &s)
            .await
            .unwrap();

        // Nothing to release yet.
        assert!(ticket.unclaim().await.unwrap_err().is_noent());

        let claimed = ticket.claim("worker1:4242").await.unwrap();
        let released = claimed.unclaim().await.unwrap();
        assert_eq!(released.claimed, None);

        released.claim("worker2:4243").await.unwrap();
    }

    #[tokio::test]
    async fn done_removes_the_ticket() {
        let s = ticket_setup().await;
        let ticket = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &s)
            .await
            .unwrap();

        ticket.done().await.unwrap();

        let head = ticket.snapshot().fast_forward(-1).await.unwrap();
        assert!(get_ticket(&head, ticket.id).await.unwrap_err().is_noent());
        assert!(tickets(&head).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tickets_lists_ascending_by_id() {
        let s = ticket_setup().await;
        let mut snapshot = s.clone();
        for _ in 0..3 {
            let t = create_ticket("cat", "7abcde6", "web", TicketOp::Start, &snapshot)
                .await
                .unwrap();
            snapshot = t.snapshot().clone();
        }

        let all = tickets(&snapshot).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(all[0].to_string(), format!("Ticket<{}> start cat@7abcde6#web", all[0].id));
    }
}
