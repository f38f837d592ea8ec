//! Revisions — deployable source references of an app.

use std::fmt;

use tracing::debug;

use crate::app::{App, app_dir};
use crate::error::{VisorError, VisorResult};
use crate::path::Path;
use crate::snapshot::{Snapshot, Versioned};
use crate::{app, epoch_secs};

pub(crate) fn revision_dir(app: &str, ref_name: &str) -> String {
    format!("{}/revs/{ref_name}", app_dir(app))
}

/// A source revision of an app, keyed by its ref string (typically a
/// VCS sha).
#[derive(Clone, Debug)]
pub struct Revision {
    pub path: Path,
    pub app_name: String,
    pub ref_name: String,
    pub archive_url: String,
}

impl Revision {
    pub fn new(app: &App, ref_name: &str, snapshot: Snapshot) -> Self {
        Self {
            path: Path::new(snapshot, revision_dir(&app.name, ref_name)),
            app_name: app.name.clone(),
            ref_name: ref_name.to_string(),
            archive_url: String::new(),
        }
    }

    /// Advance the revision to `rev` (`-1` for the store head).
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<Revision> {
        crate::snapshot::fast_forward(self, rev).await
    }

    /// Persist the revision. The owning app must already be registered.
    pub async fn register(&self) -> VisorResult<Revision> {
        let conn = &self.snapshot().conn;
        let (app_exists, _) = conn.exists(&app_dir(&self.app_name), None).await?;
        if !app_exists {
            return Err(VisorError::NotFound(format!("app '{}'", self.app_name)));
        }
        let (exists, _) = conn.exists(&self.path.dir, None).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }

        self.snapshot()
            .set(&self.path.prefix("archive-url"), &self.archive_url)
            .await?;
        let done = self
            .snapshot()
            .set(&self.path.prefix("registered"), &epoch_secs().to_string())
            .await?;

        debug!(app = %self.app_name, ref_name = %self.ref_name, rev = done.rev, "revision registered");
        Ok(self.rebind(done))
    }

    /// Remove the revision and everything under it.
    pub async fn unregister(&self) -> VisorResult<()> {
        self.snapshot().del(&self.path.prefix("/")).await?;
        Ok(())
    }
}

impl Versioned for Revision {
    fn snapshot(&self) -> &Snapshot {
        &self.path.snapshot
    }

    fn rebind(&self, snapshot: Snapshot) -> Self {
        let mut rev = self.clone();
        rev.path = Path::new(snapshot, rev.path.dir.clone());
        rev
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.app_name, self.ref_name)
    }
}

/// Fetch a registered revision of an app by ref.
pub async fn get_revision(
    snapshot: &Snapshot,
    app: &App,
    ref_name: &str,
) -> VisorResult<Revision> {
    let mut rev = Revision::new(app, ref_name, snapshot.clone());
    let (archive_url, _) = snapshot.get(&rev.path.prefix("archive-url")).await?;
    rev.archive_url = archive_url;
    Ok(rev)
}

/// All revisions of all registered apps, at the store's head revision.
pub async fn revisions(snapshot: &Snapshot) -> VisorResult<Vec<Revision>> {
    let mut all = Vec::new();
    for app in app::apps(snapshot).await? {
        all.extend(app.revisions().await?);
    }
    Ok(all)
}
