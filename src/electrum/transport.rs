//! Persistent TCP connection speaking newline-delimited JSON-RPC.
//!
//! One reader task demultiplexes the response stream: subscription
//! pushes route to the event channel by method name, replies resolve the
//! pending request registered under their id. Frames are consumed only
//! at `\n` boundaries, so a partial frame at a read boundary stays
//! buffered until the rest arrives.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::messages::{Frame, RawFrame, RpcRequest};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Destroyed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Destroyed => "destroyed",
        };
        write!(f, "{name}")
    }
}

/// Status transition published on every state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub prev: ConnectionStatus,
    pub new: ConnectionStatus,
}

/// Out-of-band observations from the reader task.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Subscription push routed by method name.
    Notification { method: String, params: Value },
    /// A frame that could not be decoded or matched to a pending call.
    /// The connection stays open.
    RequestError { detail: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Io(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("rpc `{method}` failed: {message} (code {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("rpc `{method}` timed out")]
    Timeout { method: String },
    #[error("connection destroyed")]
    Destroyed,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value, TransportError>>,
}

struct Inner {
    host: String,
    port: u16,
    connect_timeout: Duration,
    request_timeout: Duration,
    status: Mutex<ConnectionStatus>,
    status_tx: watch::Sender<StatusChange>,
    events_tx: broadcast::Sender<TransportEvent>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    /// Never reset: ids stay unique for the lifetime of the connection,
    /// across reconnects included.
    next_id: AtomicU64,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Bumped on every (re)connect so a superseded reader task skips the
    /// shared cleanup when it winds down.
    generation: AtomicU64,
}

/// Handle to the persistent Electrum connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (status_tx, _) = watch::channel(StatusChange {
            prev: ConnectionStatus::Disconnected,
            new: ConnectionStatus::Disconnected,
        });
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                connect_timeout,
                request_timeout,
                status: Mutex::new(ConnectionStatus::Disconnected),
                status_tx,
                events_tx,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                writer: tokio::sync::Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.lock()
    }

    /// Observe status transitions as `(prev, new)` pairs.
    pub fn status_changes(&self) -> watch::Receiver<StatusChange> {
        self.inner.status_tx.subscribe()
    }

    /// Observe subscription pushes and request-error events.
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Establish the TCP session and start the reader task.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.status() == ConnectionStatus::Destroyed {
            return Err(TransportError::Destroyed);
        }
        self.inner.set_status(ConnectionStatus::Connecting);
        let address = (self.inner.host.as_str(), self.inner.port);
        let stream = match timeout(self.inner.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.inner.set_status(ConnectionStatus::Error);
                return Err(err.into());
            }
            Err(_) => {
                self.inner.set_status(ConnectionStatus::Error);
                return Err(TransportError::Io(format!(
                    "connect to {}:{} timed out",
                    self.inner.host, self.inner.port
                )));
            }
        };
        let (read_half, write_half) = stream.into_split();
        *self.inner.writer.lock().await = Some(write_half);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            read_loop(inner, read_half, generation).await;
        });
        self.inner.set_status(ConnectionStatus::Connected);
        info!(host = %self.inner.host, port = self.inner.port, "electrum connection established");
        Ok(())
    }

    /// Tear the session down and bring it back up. In-flight requests
    /// fail with a transport error; the caller re-issues subscriptions.
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        if self.status() == ConnectionStatus::Destroyed {
            return Err(TransportError::Destroyed);
        }
        self.inner.writer.lock().await.take();
        // Supersede the old reader before its EOF handling can race the
        // new session's status transitions.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.fail_pending();
        self.inner.set_status(ConnectionStatus::Disconnected);
        self.connect().await
    }

    /// Terminal shutdown: no further calls or connects are possible.
    pub async fn destroy(&self) {
        self.inner.writer.lock().await.take();
        self.inner.fail_pending();
        self.inner.set_status(ConnectionStatus::Destroyed);
    }

    /// Issue a request and await its reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(
            id,
            PendingCall {
                method: method.to_string(),
                tx,
            },
        );

        let mut line = match serde_json::to_vec(&RpcRequest::new(id, method, params)) {
            Ok(line) => line,
            Err(err) => {
                self.inner.pending.lock().remove(&id);
                return Err(TransportError::Io(err.to_string()));
            }
        };
        line.push(b'\n');

        {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.inner.pending.lock().remove(&id);
                return Err(TransportError::NotConnected);
            };
            if let Err(err) = writer.write_all(&line).await {
                self.inner.pending.lock().remove(&id);
                self.inner.set_status(ConnectionStatus::Error);
                return Err(err.into());
            }
        }
        debug!(id, method, "rpc request sent");

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }
}

impl Inner {
    fn set_status(&self, new: ConnectionStatus) {
        let mut status = self.status.lock();
        let prev = *status;
        if prev == new || prev == ConnectionStatus::Destroyed {
            return;
        }
        *status = new;
        drop(status);
        debug!(%prev, %new, "connection status changed");
        self.status_tx.send_replace(StatusChange { prev, new });
    }

    /// Fail every in-flight request with a transport error.
    fn fail_pending(&self) {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        for call in drained {
            let _ = call.tx.send(Err(TransportError::ConnectionClosed));
        }
    }

    fn emit_request_error(&self, detail: String) {
        warn!(%detail, "request error");
        let _ = self
            .events_tx
            .send(TransportEvent::RequestError { detail });
    }

    fn dispatch_frame(&self, line: &[u8]) {
        let raw: RawFrame = match serde_json::from_slice(line) {
            Ok(raw) => raw,
            Err(err) => {
                self.emit_request_error(format!("undecodable frame: {err}"));
                return;
            }
        };
        match Frame::classify(raw) {
            Ok(Frame::Push { method, params }) => {
                debug!(%method, "subscription push");
                let _ = self
                    .events_tx
                    .send(TransportEvent::Notification { method, params });
            }
            Ok(Frame::Reply { id, result }) => {
                let Some(call) = self.pending.lock().remove(&id) else {
                    self.emit_request_error(format!("no pending request for id {id}"));
                    return;
                };
                let outcome = result.map_err(|error| TransportError::Rpc {
                    method: call.method.clone(),
                    code: error.code,
                    message: error.message,
                });
                let _ = call.tx.send(outcome);
            }
            Err(_) => {
                self.emit_request_error("frame carries neither method nor id".to_string());
            }
        }
    }
}

async fn read_loop(inner: Arc<Inner>, read_half: OwnedReadHalf, generation: u64) {
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    let clean = loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break true,
            Ok(_) => {
                if line.last() != Some(&b'\n') {
                    // EOF cut a frame short; nothing routable remains.
                    break true;
                }
                inner.dispatch_frame(&line);
            }
            Err(err) => {
                warn!(error = %err, "socket read failed");
                break false;
            }
        }
    };
    // A superseded reader (reconnect already happened) must not clobber
    // the new session's state.
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    inner.fail_pending();
    inner.set_status(if clean {
        ConnectionStatus::Disconnected
    } else {
        ConnectionStatus::Error
    });
}
