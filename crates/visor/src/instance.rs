//! Instances — running processes bound to a host:port.
//!
//! An instance lives under its revision's proc subtree, identified by its
//! normalized TCP address (`host:port` with `.` and `:` replaced by `-`),
//! so two instances with the same address cannot coexist under one proc
//! type.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::app::app_dir;
use crate::error::{VisorError, VisorResult};
use crate::path::Path;
use crate::proctype::{ProcType, proc_types};
use crate::revision::{Revision, revision_dir};
use crate::snapshot::{Snapshot, Versioned};
use crate::epoch_secs;

pub(crate) fn instances_dir(app: &str, ref_name: &str, proc_name: &str) -> String {
    format!("{}/procs/{proc_name}/instances", revision_dir(app, ref_name))
}

/// Lifecycle state of an instance, stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsState {
    Initial,
    Started,
    Ready,
    Failed,
    Dead,
    Exited,
}

impl InsState {
    pub fn code(self) -> i64 {
        match self {
            InsState::Initial => 0,
            InsState::Started => 1,
            InsState::Ready => 2,
            InsState::Failed => 3,
            InsState::Dead => 4,
            InsState::Exited => 5,
        }
    }

    pub fn from_code(code: i64) -> VisorResult<Self> {
        match code {
            0 => Ok(InsState::Initial),
            1 => Ok(InsState::Started),
            2 => Ok(InsState::Ready),
            3 => Ok(InsState::Failed),
            4 => Ok(InsState::Dead),
            5 => Ok(InsState::Exited),
            other => Err(VisorError::BadValue(format!(
                "unknown instance state code {other}"
            ))),
        }
    }
}

impl fmt::Display for InsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsState::Initial => "initial",
            InsState::Started => "started",
            InsState::Ready => "ready",
            InsState::Failed => "failed",
            InsState::Dead => "dead",
            InsState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// A running process of a specific proc type at a specific revision.
#[derive(Clone, Debug)]
pub struct Instance {
    pub path: Path,
    pub app_name: String,
    pub ref_name: String,
    pub proc_name: String,
    pub host: String,
    pub port: u16,
    pub state: InsState,
}

impl Instance {
    /// New in-memory instance handle for `addr` (`host:port`).
    pub fn new(
        proc_type: &ProcType,
        revision: &Revision,
        addr: &str,
        state: InsState,
        snapshot: Snapshot,
    ) -> VisorResult<Self> {
        let (host, port) = parse_addr(addr)?;
        let id = instance_id(&host, port);
        let dir = format!(
            "{}/{id}",
            instances_dir(&proc_type.app_name, &revision.ref_name, &proc_type.name)
        );
        Ok(Self {
            path: Path::new(snapshot, dir),
            app_name: proc_type.app_name.clone(),
            ref_name: revision.ref_name.clone(),
            proc_name: proc_type.name.clone(),
            host,
            port,
            state,
        })
    }

    /// Normalized address identifying this instance in the store.
    pub fn id(&self) -> String {
        instance_id(&self.host, self.port)
    }

    /// Advance the instance to `rev` (`-1` for the store head).
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<Instance> {
        crate::snapshot::fast_forward(self, rev).await
    }

    /// Persist the instance: host, port and state commit atomically,
    /// then the registration timestamp (the key watchers subscribe to).
    ///
    /// Only instances in the `Initial` state may register.
    pub async fn register(&self) -> VisorResult<Instance> {
        let (exists, _) = self.snapshot().exists(&self.path.prefix("/")).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }
        if self.state != InsState::Initial {
            return Err(VisorError::InvalidState);
        }

        let values = HashMap::from([
            ("host".to_string(), self.host.as_bytes().to_vec()),
            ("port".to_string(), self.port.to_string().into_bytes()),
            ("state".to_string(), self.state.code().to_string().into_bytes()),
        ]);
        self.snapshot()
            .set_multi(&self.path.prefix("/"), values)
            .await?;
        let done = self
            .snapshot()
            .set(&self.path.prefix("registered"), &epoch_secs().to_string())
            .await?;

        debug!(instance = %self, rev = done.rev, "instance registered");
        Ok(self.rebind(done))
    }

    /// Remove the instance's subtree.
    pub async fn unregister(&self) -> VisorResult<()> {
        self.snapshot().del(&self.path.prefix("/")).await?;
        Ok(())
    }

    /// CAS write of a new lifecycle state. Fails with
    /// [`RevMismatch`](visor_store::StoreError::RevMismatch) if another
    /// writer got there first.
    pub async fn update_state(&self, state: InsState) -> VisorResult<Instance> {
        let snapshot = self
            .snapshot()
            .set(&self.path.prefix("state"), &state.code().to_string())
            .await?;
        let mut instance = self.rebind(snapshot);
        instance.state = state;
        Ok(instance)
    }
}

impl Versioned for Instance {
    fn snapshot(&self) -> &Snapshot {
        &self.path.snapshot
    }

    fn rebind(&self, snapshot: Snapshot) -> Self {
        let mut instance = self.clone();
        instance.path = Path::new(snapshot, instance.path.dir.clone());
        instance
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{} {}:{} ({})",
            self.app_name, self.proc_name, self.ref_name, self.host, self.port, self.state
        )
    }
}

/// Instance information as plain ids, for consumers that don't need a
/// live handle (watch events, listings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub name: String,
    pub app_name: String,
    pub ref_name: String,
    pub proc_name: String,
    pub host: String,
    pub port: u16,
    pub state: InsState,
}

/// Hydrate an [`InstanceInfo`] from its ids, reading as of `snapshot`.
pub async fn get_instance_info(
    snapshot: &Snapshot,
    app: &str,
    ref_name: &str,
    proc_name: &str,
    id: &str,
) -> VisorResult<InstanceInfo> {
    let base = format!("{}/{id}", instances_dir(app, ref_name, proc_name));

    let (state, _) = snapshot.get(&format!("{base}/state")).await?;
    let (host, _) = snapshot.get(&format!("{base}/host")).await?;
    let (port, _) = snapshot.get(&format!("{base}/port")).await?;

    let code = state
        .trim()
        .parse()
        .map_err(|_| VisorError::BadValue(format!("instance state holds {state:?}")))?;
    let port = port
        .trim()
        .parse()
        .map_err(|_| VisorError::BadValue(format!("instance port holds {port:?}")))?;

    Ok(InstanceInfo {
        name: id.to_string(),
        app_name: app.to_string(),
        ref_name: ref_name.to_string(),
        proc_name: proc_name.to_string(),
        host,
        port,
        state: InsState::from_code(code)?,
    })
}

/// All registered instances of one proc type, across every revision of
/// its app.
pub async fn proc_type_instances(
    snapshot: &Snapshot,
    proc_type: &ProcType,
) -> VisorResult<Vec<Instance>> {
    let revs_dir = format!("{}/revs", app_dir(&proc_type.app_name));
    let refs = match snapshot.getdir(&revs_dir).await {
        Ok(refs) => refs,
        Err(e) if e.is_noent() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut instances = Vec::new();
    for ref_name in refs {
        let dir = instances_dir(&proc_type.app_name, &ref_name, &proc_type.name);
        let ids = match snapshot.getdir(&dir).await {
            Ok(ids) => ids,
            Err(e) if e.is_noent() => continue,
            Err(e) => return Err(e),
        };
        for id in ids {
            let info = get_instance_info(
                snapshot,
                &proc_type.app_name,
                &ref_name,
                &proc_type.name,
                &id,
            )
            .await?;
            instances.push(Instance {
                path: Path::new(snapshot.clone(), format!("{dir}/{id}")),
                app_name: info.app_name,
                ref_name: info.ref_name,
                proc_name: info.proc_name,
                host: info.host,
                port: info.port,
                state: info.state,
            });
        }
    }
    Ok(instances)
}

/// All registered instances across every app.
pub async fn instances(snapshot: &Snapshot) -> VisorResult<Vec<Instance>> {
    let mut all = Vec::new();
    for proc_type in proc_types(snapshot).await? {
        all.extend(proc_type_instances(snapshot, &proc_type).await?);
    }
    Ok(all)
}

/// All registered instances running on `host`.
pub async fn host_instances(snapshot: &Snapshot, host: &str) -> VisorResult<Vec<Instance>> {
    let mut all = instances(snapshot).await?;
    all.retain(|i| i.host == host);
    Ok(all)
}

fn parse_addr(addr: &str) -> VisorResult<(String, u16)> {
    let bad = || VisorError::BadValue(format!("invalid instance address {addr:?}"));
    let (host, port) = addr.rsplit_once(':').ok_or_else(bad)?;
    if host.is_empty() {
        return Err(bad());
    }
    let port = port.parse().map_err(|_| bad())?;
    Ok((host.to_string(), port))
}

fn instance_id(host: &str, port: u16) -> String {
    format!("{host}:{port}").replace(['.', ':'], "-")
}
