//! RemoteStore — TCP client for a networked coordinator.
//!
//! Speaks a newline-delimited JSON frame protocol: every request carries a
//! client-assigned id, and responses are correlated back to callers by that
//! id, so any number of calls (including indefinitely-blocking waits) can
//! be in flight on one connection. Binary bodies travel base64-encoded.
//!
//! The server side of this protocol is any coordinator that implements the
//! same eight operations; the rest of the workspace never sees the wire.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::event::StoreEvent;
use crate::store::Coordinator;

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    id: u64,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rev: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    values: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    glob: Option<&'a str>,
}

impl<'a> WireRequest<'a> {
    fn new(id: u64, op: &'static str) -> Self {
        Self {
            id,
            op,
            path: None,
            rev: None,
            value: None,
            values: None,
            glob: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    id: u64,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    rev: Option<i64>,
    #[serde(default)]
    present: Option<bool>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    names: Option<Vec<String>>,
    #[serde(default)]
    event: Option<WireEvent>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    written: Option<i64>,
    #[serde(default)]
    seen: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    path: String,
    rev: i64,
    #[serde(default)]
    body: Option<String>,
}

impl From<WireError> for StoreError {
    fn from(wire: WireError) -> Self {
        let path = wire.path.unwrap_or_default();
        match wire.kind.as_str() {
            "noent" => StoreError::NoEnt(path),
            "rev-mismatch" => StoreError::RevMismatch {
                path,
                written: wire.written.unwrap_or(0),
                seen: wire.seen.unwrap_or(0),
            },
            "bad-path" => StoreError::BadPath(path),
            "closed" => StoreError::Closed,
            _ => StoreError::Transport(wire.message),
        }
    }
}

fn decode_body(b64: &str) -> StoreResult<Vec<u8>> {
    BASE64
        .decode(b64)
        .map_err(|e| StoreError::Transport(format!("malformed body in frame: {e}")))
}

impl WireEvent {
    fn into_event(self) -> StoreResult<StoreEvent> {
        let body = self.body.as_deref().map(decode_body).transpose()?;
        Ok(StoreEvent {
            path: self.path,
            body,
            rev: self.rev,
        })
    }
}

#[derive(Default)]
struct Pending {
    calls: HashMap<u64, oneshot::Sender<WireResponse>>,
    /// Set once the reader task dies; any call arriving after that fails
    /// immediately with the recorded reason.
    dead: Option<String>,
}

/// [`Coordinator`] backend talking to a coordination server over TCP.
///
/// Cloneable via `Arc`; safe for concurrent use from any number of tasks.
pub struct RemoteStore {
    next_id: AtomicU64,
    writer: AsyncMutex<OwnedWriteHalf>,
    pending: Arc<Mutex<Pending>>,
}

impl RemoteStore {
    /// Connect to a coordinator at `addr` (e.g. `localhost:8046`).
    pub async fn connect(addr: &str) -> StoreResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| StoreError::Transport(format!("connect {addr}: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(Mutex::new(Pending::default()));

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let frame: WireResponse = match serde_json::from_str(&line) {
                            Ok(frame) => frame,
                            Err(e) => break format!("malformed frame: {e}"),
                        };
                        let sender = reader_pending.lock().calls.remove(&frame.id);
                        match sender {
                            // Receiver gave up; nothing to deliver to.
                            None => debug!(id = frame.id, "dropping orphaned frame"),
                            Some(tx) => {
                                let _ = tx.send(frame);
                            }
                        }
                    }
                    Ok(None) => break "connection closed by peer".to_string(),
                    Err(e) => break format!("read: {e}"),
                }
            };
            warn!(%reason, "coordinator connection lost");
            let mut pending = reader_pending.lock();
            pending.dead = Some(reason);
            // Dropping the senders fails every in-flight call.
            pending.calls.clear();
        });

        debug!(addr, "connected to coordinator");
        Ok(Self {
            next_id: AtomicU64::new(1),
            writer: AsyncMutex::new(write_half),
            pending,
        })
    }

    /// Shut the connection down. In-flight calls, including waits, fail
    /// with a transport error.
    pub async fn close(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }

    fn transport_dead(&self) -> StoreError {
        let pending = self.pending.lock();
        let reason = pending.dead.as_deref().unwrap_or("connection closed");
        StoreError::Transport(reason.to_string())
    }

    async fn call(&self, request: WireRequest<'_>) -> StoreResult<WireResponse> {
        let id = request.id;
        let rx = {
            let mut pending = self.pending.lock();
            if let Some(reason) = &pending.dead {
                return Err(StoreError::Transport(reason.clone()));
            }
            let (tx, rx) = oneshot::channel();
            pending.calls.insert(id, tx);
            rx
        };

        let mut line = serde_json::to_string(&request)
            .map_err(|e| StoreError::Transport(format!("encode frame: {e}")))?;
        line.push('\n');

        if let Err(e) = self.writer.lock().await.write_all(line.as_bytes()).await {
            self.pending.lock().calls.remove(&id);
            return Err(StoreError::Transport(format!("write: {e}")));
        }

        let response = match rx.await {
            Ok(response) => response,
            Err(_) => return Err(self.transport_dead()),
        };
        match response.error {
            Some(error) => Err(error.into()),
            None => Ok(response),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

fn missing(field: &str) -> StoreError {
    StoreError::Transport(format!("frame missing {field}"))
}

#[async_trait]
impl Coordinator for RemoteStore {
    async fn rev(&self) -> StoreResult<i64> {
        let response = self.call(WireRequest::new(self.id(), "rev")).await?;
        response.rev.ok_or_else(|| missing("rev"))
    }

    async fn exists(&self, path: &str, rev: Option<i64>) -> StoreResult<(bool, i64)> {
        let mut request = WireRequest::new(self.id(), "exists");
        request.path = Some(path);
        request.rev = rev;
        let response = self.call(request).await?;
        Ok((
            response.present.ok_or_else(|| missing("present"))?,
            response.rev.unwrap_or(0),
        ))
    }

    async fn get(&self, path: &str, rev: Option<i64>) -> StoreResult<(Vec<u8>, i64)> {
        let mut request = WireRequest::new(self.id(), "get");
        request.path = Some(path);
        request.rev = rev;
        let response = self.call(request).await?;
        let value = decode_body(&response.value.ok_or_else(|| missing("value"))?)?;
        Ok((value, response.rev.ok_or_else(|| missing("rev"))?))
    }

    async fn getdir(&self, path: &str, rev: i64) -> StoreResult<Vec<String>> {
        let mut request = WireRequest::new(self.id(), "getdir");
        request.path = Some(path);
        request.rev = Some(rev);
        let response = self.call(request).await?;
        response.names.ok_or_else(|| missing("names"))
    }

    async fn set(&self, path: &str, rev: i64, value: Vec<u8>) -> StoreResult<i64> {
        let mut request = WireRequest::new(self.id(), "set");
        request.path = Some(path);
        request.rev = Some(rev);
        request.value = Some(BASE64.encode(value));
        let response = self.call(request).await?;
        response.rev.ok_or_else(|| missing("rev"))
    }

    async fn set_multi(
        &self,
        path: &str,
        values: HashMap<String, Vec<u8>>,
        rev: i64,
    ) -> StoreResult<i64> {
        let mut request = WireRequest::new(self.id(), "setmulti");
        request.path = Some(path);
        request.rev = Some(rev);
        request.values = Some(
            values
                .into_iter()
                .map(|(k, v)| (k, BASE64.encode(v)))
                .collect(),
        );
        let response = self.call(request).await?;
        response.rev.ok_or_else(|| missing("rev"))
    }

    async fn del(&self, path: &str, rev: i64) -> StoreResult<i64> {
        let mut request = WireRequest::new(self.id(), "del");
        request.path = Some(path);
        request.rev = Some(rev);
        let response = self.call(request).await?;
        response.rev.ok_or_else(|| missing("rev"))
    }

    async fn wait(&self, glob: &str, rev: i64) -> StoreResult<StoreEvent> {
        let mut request = WireRequest::new(self.id(), "wait");
        request.glob = Some(glob);
        request.rev = Some(rev);
        let response = self.call(request).await?;
        response.event.ok_or_else(|| missing("event"))?.into_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frames_omit_absent_fields() {
        let request = WireRequest::new(7, "rev");
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":7,"op":"rev"}"#);

        let mut request = WireRequest::new(8, "set");
        request.path = Some("/k");
        request.rev = Some(3);
        request.value = Some(BASE64.encode(b"v"));
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":8,"op":"set","path":"/k","rev":3,"value":"dg=="}"#);
    }

    #[test]
    fn response_frames_decode_values_and_events() {
        let frame: WireResponse =
            serde_json::from_str(r#"{"id":1,"rev":4,"value":"aG9sYQ=="}"#).unwrap();
        assert_eq!(decode_body(frame.value.as_deref().unwrap()).unwrap(), b"hola");
        assert_eq!(frame.rev, Some(4));

        let frame: WireResponse = serde_json::from_str(
            r#"{"id":2,"event":{"path":"/k","rev":9,"body":"eA=="}}"#,
        )
        .unwrap();
        let event = frame.event.unwrap().into_event().unwrap();
        assert_eq!(event.rev, 9);
        assert_eq!(event.body.as_deref(), Some(b"x".as_slice()));

        // Deletion events carry no body.
        let frame: WireResponse =
            serde_json::from_str(r#"{"id":3,"event":{"path":"/k","rev":10}}"#).unwrap();
        assert!(!frame.event.unwrap().into_event().unwrap().is_set());
    }

    #[test]
    fn error_frames_map_to_store_errors() {
        let err: WireError =
            serde_json::from_str(r#"{"kind":"noent","path":"/gone"}"#).unwrap();
        assert!(StoreError::from(err).is_noent());

        let err: WireError = serde_json::from_str(
            r#"{"kind":"rev-mismatch","path":"/k","written":9,"seen":4}"#,
        )
        .unwrap();
        match StoreError::from(err) {
            StoreError::RevMismatch { written, seen, .. } => {
                assert_eq!((written, seen), (9, 4));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err: WireError =
            serde_json::from_str(r#"{"kind":"boom","message":"oops"}"#).unwrap();
        assert!(matches!(StoreError::from(err), StoreError::Transport(m) if m == "oops"));
    }
}
