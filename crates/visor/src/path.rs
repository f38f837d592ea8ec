//! Directory-scoped key building and typed file records.

use crate::codec::Codec;
use crate::error::{VisorError, VisorResult};
use crate::snapshot::Snapshot;

/// A snapshot anchored at a directory: the base every entity builds its
/// keys from.
#[derive(Clone, Debug)]
pub struct Path {
    pub snapshot: Snapshot,
    pub dir: String,
}

impl Path {
    pub fn new(snapshot: Snapshot, dir: String) -> Self {
        Self { snapshot, dir }
    }

    /// Join the directory with `key`. `"/"` names the directory itself.
    pub fn prefix(&self, key: &str) -> String {
        if key == "/" {
            self.dir.clone()
        } else {
            format!("{}/{}", self.dir, key.trim_start_matches('/'))
        }
    }
}

/// A typed record: one store key, its codec, and the decoded value, all
/// anchored to a snapshot.
pub struct File<C: Codec> {
    pub snapshot: Snapshot,
    pub path: String,
    pub codec: C,
    pub value: C::Value,
}

impl<C: Codec> std::fmt::Debug for File<C>
where
    C: std::fmt::Debug,
    C::Value: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("snapshot", &self.snapshot)
            .field("path", &self.path)
            .field("codec", &self.codec)
            .field("value", &self.value)
            .finish()
    }
}

impl<C: Codec> File<C> {
    pub fn new(snapshot: Snapshot, path: String, codec: C, value: C::Value) -> Self {
        Self {
            snapshot,
            path,
            codec,
            value,
        }
    }

    /// Persist a record that must not exist yet.
    pub async fn create(self) -> VisorResult<File<C>> {
        let (exists, _) = self.snapshot.conn.exists(&self.path, None).await?;
        if exists {
            return Err(VisorError::KeyConflict);
        }
        self.write(None).await
    }

    /// Overwrite the record with `value`, CAS-guarded by the file's
    /// snapshot.
    pub async fn set(self, value: C::Value) -> VisorResult<File<C>> {
        self.write(Some(value)).await
    }

    /// Delete the record.
    pub async fn del(self) -> VisorResult<()> {
        self.snapshot.del(&self.path).await?;
        Ok(())
    }

    async fn write(self, value: Option<C::Value>) -> VisorResult<File<C>> {
        let value = value.unwrap_or(self.value);
        let bytes = self.codec.encode(&value)?;
        let snapshot = self.snapshot.set_bytes(&self.path, bytes).await?;
        Ok(File {
            snapshot,
            path: self.path,
            codec: self.codec,
            value,
        })
    }
}

/// Read the record at `path` as of the given snapshot.
pub async fn get_file<C: Codec>(
    snapshot: &Snapshot,
    path: &str,
    codec: C,
) -> VisorResult<File<C>> {
    let (bytes, _) = snapshot.get_bytes(path).await?;
    let value = codec.decode(&bytes)?;
    Ok(File {
        snapshot: snapshot.clone(),
        path: path.to_string(),
        codec,
        value,
    })
}

/// Read the record at `path` as of the store's head revision.
pub async fn get_latest_file<C: Codec>(
    snapshot: &Snapshot,
    path: &str,
    codec: C,
) -> VisorResult<File<C>> {
    let head = snapshot.fast_forward(-1).await?;
    get_file(&head, path, codec).await
}
