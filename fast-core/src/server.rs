//! The server half of the engine.
//!
//! A [`FastServer`] owns a registry of RPC handlers and drives one task per
//! accepted connection. Each connection runs a frame-decoder loop that
//! dispatches well-formed DATA messages to handler tasks; every handler gets
//! an [`RpcContext`] for emitting values and exactly one terminal. One writer
//! task per connection serializes all outbound frames, which both preserves
//! per-request ordering and lets `write` exert back-pressure on handlers
//! through its bounded queue.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::codec::{FastFrameCodec, MessageEncoder};
use crate::crc::CrcMode;
use crate::error::{RegistrationError, RpcError};
use crate::proto::{FastMessage, MessageStatus, FP_DATA_LEN_MAX_DEFAULT};

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(0);

/// Depth of the per-connection outbound frame queue. Handlers writing faster
/// than the transport drains are suspended in `RpcContext::write`.
const OUTBOUND_QUEUE_DEPTH: usize = 128;

/// Construction parameters for a [`FastServer`].
#[derive(Debug, Clone)]
pub struct FastServerConfig {
    /// Label used in emitted events.
    pub label: String,
    pub crc_mode: CrcMode,
    /// Cap on the payload length of a single inbound frame.
    pub max_data_len: usize,
    /// How long a draining connection waits for in-flight requests before it
    /// is destroyed anyway.
    pub drain_timeout: Duration,
    /// How many completed requests to retain for introspection.
    pub n_recent_requests: usize,
}

impl Default for FastServerConfig {
    fn default() -> FastServerConfig {
        FastServerConfig {
            label: "fast-server".into(),
            crc_mode: CrcMode::default(),
            max_data_len: FP_DATA_LEN_MAX_DEFAULT,
            drain_timeout: Duration::from_secs(30),
            n_recent_requests: 10,
        }
    }
}

/// A registered RPC method implementation.
///
/// Plain `async fn`-returning closures implement this automatically, so
/// registration usually looks like:
///
/// ```ignore
/// server.register_rpc_method("echo", |mut rpc: RpcContext| async move {
///     for arg in rpc.argv().to_vec() {
///         rpc.write(arg).await;
///     }
///     rpc.end(None).await;
/// })?;
/// ```
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(&self, rpc: RpcContext);
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(RpcContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, rpc: RpcContext) {
        (self)(rpc).await;
    }
}

/// One queued outbound event for a connection's writer task.
enum OutFrame {
    Data {
        msgid: u32,
        method: String,
        value: Value,
    },
    End {
        msgid: u32,
        method: String,
        value: Option<Value>,
    },
    Error {
        msgid: u32,
        method: String,
        error: RpcError,
    },
}

struct ActiveRpc {
    method: String,
    started: Instant,
}

type ActiveMap = Arc<Mutex<HashMap<u32, ActiveRpc>>>;

/// Outcome of a completed request, retained in the recent-requests ring.
#[derive(Debug, Clone, Serialize)]
pub struct RpcOutcome {
    pub conn_id: u64,
    pub msgid: u32,
    pub method: String,
    pub error: Option<String>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct InflightRpc {
    pub msgid: u32,
    pub method: String,
    pub age: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnSnapshot {
    pub conn_id: u64,
    pub label: String,
    pub inflight: Vec<InflightRpc>,
}

/// Point-in-time introspection of a server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSnapshot {
    pub server_id: u64,
    pub label: String,
    pub connections_created: u64,
    pub rpc_started: u64,
    pub rpc_completed: u64,
    pub rpc_failed: u64,
    pub conns: Vec<ConnSnapshot>,
    pub recent: Vec<RpcOutcome>,
}

struct ConnEntry {
    label: String,
    active: ActiveMap,
}

struct ServerInner {
    server_id: u64,
    label: String,
    crc_mode: CrcMode,
    max_data_len: usize,
    drain_timeout: Duration,
    n_recent: usize,
    handlers: Mutex<HashMap<String, Arc<dyn RpcHandler>>>,
    next_conn_id: AtomicU64,
    conns: Mutex<HashMap<u64, ConnEntry>>,
    conn_exit: Notify,
    closed: watch::Sender<bool>,
    connections_created: AtomicU64,
    rpc_started: AtomicU64,
    rpc_completed: AtomicU64,
    rpc_failed: AtomicU64,
    recent: Mutex<VecDeque<RpcOutcome>>,
}

impl ServerInner {
    fn push_recent(&self, outcome: RpcOutcome) {
        if self.n_recent == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap();
        if recent.len() == self.n_recent {
            recent.pop_front();
        }
        recent.push_back(outcome);
    }

    async fn wait_connections_drained(&self) {
        loop {
            let notified = self.conn_exit.notified();
            if self.conns.lock().unwrap().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// The per-request object handed to an [`RpcHandler`].
pub struct RpcContext {
    server: Arc<ServerInner>,
    conn_id: u64,
    msgid: u32,
    method: String,
    argv: Vec<Value>,
    out: mpsc::Sender<OutFrame>,
    active: ActiveMap,
    started: Instant,
    done: bool,
}

impl RpcContext {
    pub fn connection_id(&self) -> u64 {
        self.conn_id
    }

    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    pub fn method_name(&self) -> &str {
        &self.method
    }

    /// The argument values the client sent with the call.
    pub fn argv(&self) -> &[Value] {
        &self.argv
    }

    /// Emit one value to the client. Suspends when the connection's outbound
    /// queue is full, so a handler naturally pauses when the transport is
    /// back-pressured.
    pub async fn write(&mut self, value: Value) {
        if self.done {
            debug!(
                conn_id = self.conn_id,
                req_id = self.msgid,
                "write after request completed (ignored)"
            );
            return;
        }
        let frame = OutFrame::Data {
            msgid: self.msgid,
            method: self.method.clone(),
            value,
        };
        if self.out.send(frame).await.is_err() {
            debug!(
                conn_id = self.conn_id,
                req_id = self.msgid,
                "connection gone; dropping rpc output"
            );
        }
    }

    /// Complete the request successfully, optionally with one final value.
    pub async fn end(&mut self, final_value: Option<Value>) {
        if self.done {
            debug!(
                conn_id = self.conn_id,
                req_id = self.msgid,
                "end after request completed (ignored)"
            );
            return;
        }
        self.done = true;
        let frame = OutFrame::End {
            msgid: self.msgid,
            method: self.method.clone(),
            value: final_value,
        };
        let _ = self.out.send(frame).await;
        self.finish(None);
    }

    /// Complete the request with a failure, sent to the client as an ERROR
    /// frame.
    pub async fn fail(&mut self, error: RpcError) {
        if self.done {
            debug!(
                conn_id = self.conn_id,
                req_id = self.msgid,
                "fail after request completed (ignored)"
            );
            return;
        }
        self.done = true;
        let frame = OutFrame::Error {
            msgid: self.msgid,
            method: self.method.clone(),
            error: error.clone(),
        };
        let _ = self.out.send(frame).await;
        self.finish(Some(error.to_string()));
    }

    fn finish(&self, error: Option<String>) {
        self.active.lock().unwrap().remove(&self.msgid);
        match &error {
            Some(err) => {
                self.server.rpc_failed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    server_id = self.server.server_id,
                    conn_id = self.conn_id,
                    req_id = self.msgid,
                    method = %self.method,
                    error = %err,
                    "rpc-done"
                );
            }
            None => {
                self.server.rpc_completed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    server_id = self.server.server_id,
                    conn_id = self.conn_id,
                    req_id = self.msgid,
                    method = %self.method,
                    "rpc-done"
                );
            }
        }
        self.server.push_recent(RpcOutcome {
            conn_id: self.conn_id,
            msgid: self.msgid,
            method: self.method.clone(),
            error,
            duration: self.started.elapsed(),
        });
    }
}

impl Drop for RpcContext {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // A handler bailed (returned early or panicked) without a terminal.
        // Fail the request rather than leaving the client waiting forever.
        self.done = true;
        warn!(
            conn_id = self.conn_id,
            req_id = self.msgid,
            method = %self.method,
            "handler returned without ending the request"
        );
        let message = "handler returned without ending the request";
        let frame = OutFrame::Error {
            msgid: self.msgid,
            method: self.method.clone(),
            error: RpcError::new(message),
        };
        if self.out.try_send(frame).is_err() {
            debug!(
                conn_id = self.conn_id,
                req_id = self.msgid,
                "could not queue synthesized error for abandoned request"
            );
        }
        self.finish(Some(message.into()));
    }
}

/// The server engine.
#[derive(Clone)]
pub struct FastServer {
    inner: Arc<ServerInner>,
}

impl FastServer {
    pub fn new(config: FastServerConfig) -> FastServer {
        let server_id = NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        let (closed, _) = watch::channel(false);
        FastServer {
            inner: Arc::new(ServerInner {
                server_id,
                label: config.label,
                crc_mode: config.crc_mode,
                max_data_len: config.max_data_len,
                drain_timeout: config.drain_timeout,
                n_recent: config.n_recent_requests,
                handlers: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(0),
                conns: Mutex::new(HashMap::new()),
                conn_exit: Notify::new(),
                closed,
                connections_created: AtomicU64::new(0),
                rpc_started: AtomicU64::new(0),
                rpc_completed: AtomicU64::new(0),
                rpc_failed: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn server_id(&self) -> u64 {
        self.inner.server_id
    }

    /// Register a handler for `method`. Registering the same name twice is
    /// an error.
    pub fn register_rpc_method(
        &self,
        method: &str,
        handler: impl RpcHandler,
    ) -> Result<(), RegistrationError> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers.contains_key(method) {
            return Err(RegistrationError {
                method: method.to_string(),
            });
        }
        handlers.insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Drive the accept loop on `listener` until [`FastServer::close`] is
    /// called, then wait for open connections to drain.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return Ok(());
        }
        debug!(
            server_id = self.inner.server_id,
            addr = ?listener.local_addr().ok(),
            "server listening"
        );
        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((sock, peer)) => {
                        let inner = self.inner.clone();
                        tokio::spawn(run_connection(inner, sock, peer));
                    }
                    Err(err) => {
                        warn!(server_id = self.inner.server_id, error = %err, "accept failed");
                    }
                },
                _ = closed.changed() => break,
            }
        }
        self.inner.wait_connections_drained().await;
        Ok(())
    }

    /// Graceful shutdown: stop accepting, stop reading new requests, let
    /// in-flight requests complete (up to the drain timeout), then destroy
    /// each connection. Returns when every connection is gone.
    pub async fn close(&self) {
        debug!(server_id = self.inner.server_id, "server close requested");
        self.inner.closed.send_replace(true);
        self.inner.wait_connections_drained().await;
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        let mut conns: Vec<ConnSnapshot> = self
            .inner
            .conns
            .lock()
            .unwrap()
            .iter()
            .map(|(conn_id, entry)| {
                let mut inflight: Vec<InflightRpc> = entry
                    .active
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(msgid, rpc)| InflightRpc {
                        msgid: *msgid,
                        method: rpc.method.clone(),
                        age: rpc.started.elapsed(),
                    })
                    .collect();
                inflight.sort_by_key(|r| r.msgid);
                ConnSnapshot {
                    conn_id: *conn_id,
                    label: entry.label.clone(),
                    inflight,
                }
            })
            .collect();
        conns.sort_by_key(|c| c.conn_id);
        ServerSnapshot {
            server_id: self.inner.server_id,
            label: self.inner.label.clone(),
            connections_created: self.inner.connections_created.load(Ordering::Relaxed),
            rpc_started: self.inner.rpc_started.load(Ordering::Relaxed),
            rpc_completed: self.inner.rpc_completed.load(Ordering::Relaxed),
            rpc_failed: self.inner.rpc_failed.load(Ordering::Relaxed),
            conns,
            recent: self.inner.recent.lock().unwrap().iter().cloned().collect(),
        }
    }
}

async fn run_connection(inner: Arc<ServerInner>, sock: TcpStream, peer: SocketAddr) {
    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let label = peer.to_string();
    inner.connections_created.fetch_add(1, Ordering::Relaxed);
    let active: ActiveMap = Arc::new(Mutex::new(HashMap::new()));
    inner.conns.lock().unwrap().insert(
        conn_id,
        ConnEntry {
            label: label.clone(),
            active: active.clone(),
        },
    );
    debug!(
        server_id = inner.server_id,
        conn_id,
        label = %label,
        "conn-create"
    );

    let (rd, wr) = sock.into_split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let writer = tokio::spawn(write_loop(
        wr,
        out_rx,
        MessageEncoder::new(inner.crc_mode),
        conn_id,
    ));

    let mut frames = FramedRead::new(
        rd,
        FastFrameCodec::new(inner.crc_mode, inner.max_data_len),
    );
    let mut handlers: JoinSet<()> = JoinSet::new();
    let mut closed = inner.closed.subscribe();

    // Whether the connection gets a drain phase. Protocol violations destroy
    // it immediately; shutdown and client EOF let in-flight requests finish.
    let mut graceful = true;
    // A shutdown signaled before this connection subscribed would otherwise
    // go unseen.
    while !*closed.borrow_and_update() {
        tokio::select! {
            _ = closed.changed() => {
                debug!(conn_id, "draining connection for shutdown");
                break;
            }
            Some(res) = handlers.join_next(), if !handlers.is_empty() => {
                reap_handler(conn_id, res);
            }
            next = frames.next() => match next {
                None => break,
                Some(Err(err)) => {
                    warn!(
                        server_id = inner.server_id,
                        conn_id,
                        error = %err,
                        "protocol error from client; destroying connection"
                    );
                    graceful = false;
                    break;
                }
                Some(Ok(msg)) => {
                    if let Err(reason) =
                        dispatch(&inner, conn_id, &active, &out_tx, &mut handlers, msg).await
                    {
                        warn!(
                            server_id = inner.server_id,
                            conn_id,
                            reason = %reason,
                            "protocol error from client; destroying connection"
                        );
                        graceful = false;
                        break;
                    }
                }
            }
        }
    }

    let mut drained = graceful;
    if graceful {
        let deadline = tokio::time::Instant::now() + inner.drain_timeout;
        while !handlers.is_empty() {
            match tokio::time::timeout_at(deadline, handlers.join_next()).await {
                Ok(Some(res)) => reap_handler(conn_id, res),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        conn_id,
                        nactive = handlers.len(),
                        "drain deadline reached; abandoning in-flight requests"
                    );
                    drained = false;
                    break;
                }
            }
        }
    }

    drop(out_tx);
    if drained {
        // Every handler has finished, so the writer drains its queue and
        // exits once the last terminal frame is flushed.
        let _ = writer.await;
    } else {
        // Late handler output is ignored from here on: killing the writer
        // closes the queue, so their writes fail fast.
        handlers.detach_all();
        writer.abort();
    }

    inner.conns.lock().unwrap().remove(&conn_id);
    debug!(server_id = inner.server_id, conn_id, "conn-destroy");
    inner.conn_exit.notify_waiters();
}

fn reap_handler(conn_id: u64, res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            warn!(conn_id, "rpc handler panicked");
        }
    }
}

/// Validate one inbound message and start its handler. Returns `Err` with a
/// reason when the message is a connection-fatal protocol violation.
async fn dispatch(
    inner: &Arc<ServerInner>,
    conn_id: u64,
    active: &ActiveMap,
    out_tx: &mpsc::Sender<OutFrame>,
    handlers: &mut JoinSet<()>,
    msg: FastMessage,
) -> Result<(), String> {
    if msg.status != MessageStatus::Data {
        return Err(format!(
            "client sent a {} message (only DATA is allowed)",
            msg.status.label()
        ));
    }
    let msgid = msg.msgid;
    let method = msg.method_name().unwrap_or("").to_string();

    let handler = inner.handlers.lock().unwrap().get(&method).cloned();
    let Some(handler) = handler else {
        debug!(
            server_id = inner.server_id,
            conn_id,
            req_id = msgid,
            method = %method,
            "unsupported RPC method"
        );
        let frame = OutFrame::Error {
            msgid,
            method: method.clone(),
            error: RpcError::new(format!("unsupported RPC method: {method}")),
        };
        let _ = out_tx.send(frame).await;
        return Ok(());
    };

    let started = Instant::now();
    {
        let mut act = active.lock().unwrap();
        if act.contains_key(&msgid) {
            return Err(format!("client reused msgid {msgid} for a new request"));
        }
        act.insert(
            msgid,
            ActiveRpc {
                method: method.clone(),
                started,
            },
        );
    }
    inner.rpc_started.fetch_add(1, Ordering::Relaxed);
    debug!(
        server_id = inner.server_id,
        conn_id,
        req_id = msgid,
        method = %method,
        "rpc-start"
    );

    let ctx = RpcContext {
        server: inner.clone(),
        conn_id,
        msgid,
        method,
        argv: msg.payload().cloned().unwrap_or_default(),
        out: out_tx.clone(),
        active: active.clone(),
        started,
        done: false,
    };
    handlers.spawn(async move { handler.handle(ctx).await });
    Ok(())
}

async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::Receiver<OutFrame>,
    encoder: MessageEncoder,
    conn_id: u64,
) {
    let mut queue: Vec<OutFrame> = Vec::with_capacity(OUTBOUND_QUEUE_DEPTH);
    loop {
        queue.clear();
        if rx.recv_many(&mut queue, OUTBOUND_QUEUE_DEPTH).await == 0 {
            return;
        }

        // Consecutive queued values for the same request coalesce into one
        // DATA frame.
        let mut messages: Vec<FastMessage> = Vec::new();
        for frame in queue.drain(..) {
            match frame {
                OutFrame::Data {
                    msgid,
                    method,
                    value,
                } => {
                    if let Some(last) = messages.last_mut() {
                        if last.msgid == msgid && last.status == MessageStatus::Data {
                            if let Some(Value::Array(d)) = last.data.get_mut("d") {
                                d.push(value);
                                continue;
                            }
                        }
                    }
                    messages.push(FastMessage::data(msgid, &method, vec![value]));
                }
                OutFrame::End {
                    msgid,
                    method,
                    value,
                } => messages.push(FastMessage::end(msgid, &method, value)),
                OutFrame::Error {
                    msgid,
                    method,
                    error,
                } => messages.push(FastMessage::error(msgid, &method, &error)),
            }
        }

        for msg in &messages {
            match encoder.encode(msg) {
                Ok(frame) => {
                    if let Err(err) = wr.write_all(&frame).await {
                        debug!(conn_id, error = %err, "connection write failed");
                        return;
                    }
                }
                Err(err) => {
                    warn!(conn_id, error = %err, "dropping unencodable frame");
                }
            }
        }
    }
}
