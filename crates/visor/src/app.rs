//! Applications — the root of the entity graph.
//!
//! An app exists iff its `attrs` key does. Environment variables live as
//! one key per name under `env/`, with underscores canonicalized to
//! dashes in the store (and mapped back on read), so both spellings name
//! the same record.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::JsonCodec;
use crate::error::{VisorError, VisorResult};
use crate::path::{File, Path, get_file};
use crate::proctype::ProcType;
use crate::revision::Revision;
use crate::snapshot::{Snapshot, Versioned};
use crate::{DEPLOY_LXC, epoch_secs};

pub(crate) const APPS_DIR: &str = "/apps";

pub(crate) fn app_dir(name: &str) -> String {
    format!("{APPS_DIR}/{name}")
}

/// Persisted attributes of an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppAttrs {
    #[serde(rename = "repo-url")]
    repo_url: String,
    stack: String,
    #[serde(rename = "deploy-type")]
    deploy_type: String,
}

/// An application and the snapshot it was observed at.
#[derive(Clone, Debug)]
pub struct App {
    pub path: Path,
    pub name: String,
    pub repo_url: String,
    pub stack: String,
    pub deploy_type: String,
    pub env: HashMap<String, String>,
}

impl App {
    /// New in-memory app handle; nothing is persisted until
    /// [`register`](App::register).
    pub fn new(name: &str, repo_url: &str, stack: &str, snapshot: Snapshot) -> Self {
        Self {
            path: Path::new(snapshot, app_dir(name)),
            name: name.to_string(),
            repo_url: repo_url.to_string(),
            stack: stack.to_string(),
            deploy_type: String::new(),
            env: HashMap::new(),
        }
    }

    /// Advance the app to `rev` (`-1` for the store head).
    pub async fn fast_forward(&self, rev: i64) -> VisorResult<App> {
        crate::snapshot::fast_forward(self, rev).await
    }

    /// Persist the app: attrs, environment, and registration timestamp.
    ///
    /// Fails with [`KeyConflict`](VisorError::KeyConflict) if the app is
    /// already registered — even through a stale snapshot. A failure
    /// partway through leaves the partial subtree in place; unregister
    /// before retrying.
    pub async fn register(&self) -> VisorResult<App> {
        let (exists, _) = self.snapshot().conn.exists(&self.path.dir, None).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }

        let mut app = self.clone();
        if app.deploy_type.is_empty() {
            app.deploy_type = DEPLOY_LXC.to_string();
        }

        let attrs = File::new(
            self.snapshot().clone(),
            self.path.prefix("attrs"),
            JsonCodec::new(),
            AppAttrs {
                repo_url: app.repo_url.clone(),
                stack: app.stack.clone(),
                deploy_type: app.deploy_type.clone(),
            },
        );
        attrs.create().await?;

        let mut names: Vec<&String> = app.env.keys().collect();
        names.sort();
        for name in names {
            let key = env_store_key(name)?;
            self.snapshot()
                .set(&self.path.prefix(&format!("env/{key}")), &app.env[name])
                .await?;
        }

        let done = self
            .snapshot()
            .set(&self.path.prefix("registered"), &epoch_secs().to_string())
            .await?;

        debug!(app = %app.name, rev = done.rev, "app registered");
        Ok(app.rebind(done))
    }

    /// Remove the app and everything under it.
    pub async fn unregister(&self) -> VisorResult<()> {
        self.snapshot().del(&self.path.prefix("/")).await?;
        debug!(app = %self.name, "app unregistered");
        Ok(())
    }

    /// Value of one environment variable. Underscores and dashes in
    /// `name` address the same record.
    pub async fn get_environment_var(&self, name: &str) -> VisorResult<String> {
        let key = env_store_key(name)?;
        let (value, _) = self
            .snapshot()
            .get(&self.path.prefix(&format!("env/{key}")))
            .await?;
        Ok(value)
    }

    /// Set one environment variable, returning the app at the post-write
    /// revision.
    pub async fn set_environment_var(&self, name: &str, value: &str) -> VisorResult<App> {
        let key = env_store_key(name)?;
        let snapshot = self
            .snapshot()
            .set(&self.path.prefix(&format!("env/{key}")), value)
            .await?;
        let mut app = self.rebind(snapshot);
        app.env.insert(name.to_string(), value.to_string());
        Ok(app)
    }

    /// Delete one environment variable.
    pub async fn del_environment_var(&self, name: &str) -> VisorResult<App> {
        let key = env_store_key(name)?;
        let snapshot = self
            .snapshot()
            .del(&self.path.prefix(&format!("env/{key}")))
            .await?;
        let mut app = self.rebind(snapshot);
        app.env.remove(name);
        Ok(app)
    }

    /// All environment variables, keyed by their application-visible
    /// (underscore) names. An app with no `env/` directory has none.
    pub async fn environment_vars(&self) -> VisorResult<HashMap<String, String>> {
        let names = match self.snapshot().getdir(&self.path.prefix("env")).await {
            Ok(names) => names,
            Err(e) if e.is_noent() => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut vars = HashMap::with_capacity(names.len());
        for name in names {
            let (value, _) = self
                .snapshot()
                .get(&self.path.prefix(&format!("env/{name}")))
                .await?;
            vars.insert(env_display_key(&name), value);
        }
        Ok(vars)
    }

    /// All registered process types of this app.
    pub async fn proc_types(&self) -> VisorResult<Vec<ProcType>> {
        let dir = self.path.prefix("procs");
        let (exists, _) = self.snapshot().conn.exists(&dir, None).await?;
        if !exists {
            return Ok(Vec::new());
        }

        let head = self.snapshot().fast_forward(-1).await?;
        let mut ptys = Vec::new();
        for name in head.getdir(&dir).await? {
            match crate::proctype::get_proc_type(&head, self, &name).await {
                Ok(pty) => ptys.push(pty),
                Err(e) if e.is_noent() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ptys)
    }

    /// All registered revisions of this app.
    pub async fn revisions(&self) -> VisorResult<Vec<Revision>> {
        let dir = self.path.prefix("revs");
        let (exists, _) = self.snapshot().conn.exists(&dir, None).await?;
        if !exists {
            return Ok(Vec::new());
        }

        let head = self.snapshot().fast_forward(-1).await?;
        let mut revs = Vec::new();
        for ref_name in head.getdir(&dir).await? {
            match crate::revision::get_revision(&head, self, &ref_name).await {
                Ok(rev) => revs.push(rev),
                Err(e) if e.is_noent() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(revs)
    }
}

impl Versioned for App {
    fn snapshot(&self) -> &Snapshot {
        &self.path.snapshot
    }

    fn rebind(&self, snapshot: Snapshot) -> Self {
        let mut app = self.clone();
        app.path = Path::new(snapshot, app.path.dir.clone());
        app
    }
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "App<{}>{{stack: {}, type: {}}}",
            self.name, self.stack, self.deploy_type
        )
    }
}

/// Fetch a registered app by name.
pub async fn get_app(snapshot: &Snapshot, name: &str) -> VisorResult<App> {
    let mut app = App::new(name, "", "", snapshot.clone());
    let attrs: File<JsonCodec<AppAttrs>> =
        get_file(snapshot, &app.path.prefix("attrs"), JsonCodec::new()).await?;
    app.repo_url = attrs.value.repo_url;
    app.stack = attrs.value.stack;
    app.deploy_type = attrs.value.deploy_type;
    Ok(app)
}

/// All registered apps, at the store's head revision. Children without
/// attrs (partially registered or mid-deletion) are skipped.
pub async fn apps(snapshot: &Snapshot) -> VisorResult<Vec<App>> {
    let (exists, _) = snapshot.conn.exists(APPS_DIR, None).await?;
    if !exists {
        return Ok(Vec::new());
    }

    let head = snapshot.fast_forward(-1).await?;
    let mut all = Vec::new();
    for name in head.getdir(APPS_DIR).await? {
        match get_app(&head, &name).await {
            Ok(app) => all.push(app),
            Err(e) if e.is_noent() => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(all)
}

/// Store key for an application-visible environment variable name.
///
/// The canonicalized (dashed) form is authoritative: both spellings map
/// to one key, so the two encodings can never coexist.
fn env_store_key(name: &str) -> VisorResult<String> {
    if name.is_empty() || name.contains('/') {
        return Err(VisorError::BadValue(format!(
            "invalid environment variable name {name:?}"
        )));
    }
    Ok(name.replace('_', "-"))
}

/// Application-visible name for a stored environment variable key.
fn env_display_key(key: &str) -> String {
    key.replace('-', "_")
}
