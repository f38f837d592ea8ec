//! Process types — named process roles within an app (e.g. `web`).

use std::fmt;

use tracing::debug;

use crate::app::{App, app_dir};
use crate::error::{VisorError, VisorResult};
use crate::path::Path;
use crate::snapshot::{Snapshot, Versioned};
use crate::{app, epoch_secs};

pub(crate) fn proc_type_dir(app: &str, name: &str) -> String {
    format!("{}/procs/{name}", app_dir(app))
}

/// A process role of an app.
#[derive(Clone, Debug)]
pub struct ProcType {
    pub path: Path,
    pub app_name: String,
    pub name: String,
}

impl ProcType {
    pub fn new(app: &App, name: &str, snapshot: Snapshot) -> Self {
        Self {
            path: Path::new(snapshot, proc_type_dir(&app.name, name)),
            app_name: app.name.clone(),
            name: name.to_string(),
        }
    }

    /// Advance the proc type to `rev` (`-1` for the store head).
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<ProcType> {
        crate::snapshot::fast_forward(self, rev).await
    }

    /// Persist the proc type. Names are lowercase alphanumeric.
    pub async fn register(&self) -> VisorResult<ProcType> {
        if !valid_name(&self.name) {
            return Err(VisorError::BadValue(format!(
                "proc type name {:?} is not lowercase alphanumeric",
                self.name
            )));
        }
        let (exists, _) = self.snapshot().conn.exists(&self.path.dir, None).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }

        let done = self
            .snapshot()
            .set(&self.path.prefix("registered"), &epoch_secs().to_string())
            .await?;

        debug!(app = %self.app_name, proc = %self.name, rev = done.rev, "proc type registered");
        Ok(self.rebind(done))
    }

    /// Remove the proc type's registration record.
    pub async fn unregister(&self) -> VisorResult<()> {
        self.snapshot().del(&self.path.prefix("/")).await?;
        Ok(())
    }
}

impl Versioned for ProcType {
    fn snapshot(&self) -> &Snapshot {
        &self.path.snapshot
    }

    fn rebind(&self, snapshot: Snapshot) -> Self {
        let mut pty = self.clone();
        pty.path = Path::new(snapshot, pty.path.dir.clone());
        pty
    }
}

impl fmt::Display for ProcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.app_name, self.name)
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Fetch a registered proc type of an app by name.
pub async fn get_proc_type(
    snapshot: &Snapshot,
    app: &App,
    name: &str,
) -> VisorResult<ProcType> {
    let pty = ProcType::new(app, name, snapshot.clone());
    // The registration record is the proc type's only state; reading it
    // doubles as the existence check.
    snapshot.get(&pty.path.prefix("registered")).await?;
    Ok(pty)
}

/// All proc types of all registered apps, at the store's head revision.
pub async fn proc_types(snapshot: &Snapshot) -> VisorResult<Vec<ProcType>> {
    let mut all = Vec::new();
    for app in app::apps(snapshot).await? {
        all.extend(app.proc_types().await?);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Conn;
    use crate::{DEFAULT_PROC_NAME, DEFAULT_ROOT, init};
    use std::sync::Arc;
    use visor_store::MemStore;

    async fn proc_setup() -> App {
        let conn = Conn::new(Arc::new(MemStore::new()), DEFAULT_ROOT);
        let s = Snapshot::head(conn).await.unwrap();
        let rev = init(&s).await.unwrap();
        let s = s.fast_forward(rev).await.unwrap();
        App::new("proc-test", "git://proc.git", "mrproper", s)
            .register()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_fetch() {
        let app = proc_setup().await;
        let pty = ProcType::new(&app, DEFAULT_PROC_NAME, app.snapshot().clone());

        let pty = pty.register().await.unwrap();
        assert!(pty.register().await.unwrap_err().is_key_conflict());

        let fetched = get_proc_type(pty.snapshot(), &app, DEFAULT_PROC_NAME)
            .await
            .unwrap();
        assert_eq!(fetched.name, "web");
        assert_eq!(fetched.path.dir, "/apps/proc-test/procs/web");
    }

    #[tokio::test]
    async fn names_must_be_lowercase_alphanumeric() {
        let app = proc_setup().await;
        for bad in ["", "Web", "web-worker", "web_worker", "wörker"] {
            let err = ProcType::new(&app, bad, app.snapshot().clone())
                .register()
                .await
                .unwrap_err();
            assert!(matches!(err, VisorError::BadValue(_)), "{bad:?} accepted");
        }

        ProcType::new(&app, "worker2", app.snapshot().clone())
            .register()
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn app_proc_types_lists_registrations() {
        let app = proc_setup().await;
        for name in ["web", "worker"] {
            ProcType::new(&app, name, app.snapshot().clone())
                .register()
                .await
                .unwrap();
        }

        let app = app.fast_forward(-1).await.unwrap();
        let mut names: Vec<String> = app
            .proc_types()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["web", "worker"]);
    }

    #[tokio::test]
    async fn unregister_then_stale_lookup_is_noent() {
        let app = proc_setup().await;
        let pty = ProcType::new(&app, "web", app.snapshot().clone())
            .register()
            .await
            .unwrap();

        pty.unregister().await.unwrap();
        let head = pty.snapshot().fast_forward(-1).await.unwrap();
        assert!(get_proc_type(&head, &app, "web").await.unwrap_err().is_noent());
    }
}
