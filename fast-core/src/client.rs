//! The client half of the engine.
//!
//! A [`FastClient`] attaches to an established bidirectional byte transport
//! and multiplexes any number of concurrent RPC calls over it. Each call gets
//! a [`FastRequest`]: a stream of zero or more values followed by exactly one
//! terminal (clean end, or a [`FastRequestError`]).
//!
//! Internally the client runs two tasks: a writer draining a queue of
//! outbound messages, and a reader driving the frame decoder and routing each
//! inbound message to its request by msgid. All request state lives behind
//! one mutex with short, non-blocking critical sections; terminal events are
//! delivered through per-request channels, so a caller never observes its own
//! `rpc()` or `abort()` re-entrantly.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, trace};

use crate::codec::{FastFrameCodec, MessageEncoder};
use crate::crc::CrcMode;
use crate::error::{
    FastError, FastRequestError, FastServerError, ProtocolError, RemoteError,
    RequestAbortedError, TimeoutError, TransportError,
};
use crate::proto::{FastMessage, MessageStatus, FP_DATA_LEN_MAX_DEFAULT, FP_MSGID_MAX};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

/// Construction parameters for a [`FastClient`].
#[derive(Debug, Clone)]
pub struct FastClientConfig {
    /// Label used in emitted events.
    pub label: String,
    pub crc_mode: CrcMode,
    /// Cap on the payload length of a single inbound frame.
    pub max_data_len: usize,
    /// How many completed requests to retain for introspection.
    pub n_recent_requests: usize,
}

impl Default for FastClientConfig {
    fn default() -> FastClientConfig {
        FastClientConfig {
            label: "fast-client".into(),
            crc_mode: CrcMode::default(),
            max_data_len: FP_DATA_LEN_MAX_DEFAULT,
            n_recent_requests: 10,
        }
    }
}

/// Parameters for one RPC call.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub method: String,
    pub args: Vec<Value>,
    /// If set, the request is aborted locally when the timer fires.
    pub timeout: Option<Duration>,
}

impl RpcOptions {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> RpcOptions {
        RpcOptions {
            method: method.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> RpcOptions {
        self.timeout = Some(timeout);
        self
    }
}

/// Allocates msgids: monotonic, never zero, wrapping to 1 before reaching
/// [`FP_MSGID_MAX`].
#[derive(Debug)]
struct MsgidAllocator {
    next: u32,
}

impl MsgidAllocator {
    fn new() -> MsgidAllocator {
        MsgidAllocator { next: 0 }
    }

    fn next(&mut self) -> u32 {
        self.next = if self.next >= FP_MSGID_MAX - 1 {
            1
        } else {
            self.next + 1
        };
        self.next
    }
}

enum RequestEvent {
    Data(Value),
    End,
    Failed(FastRequestError),
}

struct Pending {
    method: String,
    started: Instant,
    ndata: u64,
    ev_tx: mpsc::UnboundedSender<RequestEvent>,
    timer: Option<JoinHandle<()>>,
    /// Most recent inbound message for this request, retained for debugging.
    last_message: Option<FastMessage>,
}

struct AbortedEntry {
    method: String,
    /// Messages received after the local abort and discarded.
    nignored: u64,
}

/// Outcome of a completed request, retained in the recent-requests ring.
#[derive(Debug, Clone, Serialize)]
pub struct RequestOutcome {
    pub msgid: u32,
    pub method: String,
    pub ndata: u64,
    pub aborted: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// A request still awaiting its terminal.
#[derive(Debug, Clone, Serialize)]
pub struct InflightRequest {
    pub msgid: u32,
    pub method: String,
    pub ndata: u64,
    pub age: Duration,
    /// Status of the most recent inbound message for this request.
    pub last_status: Option<&'static str>,
}

/// A locally-aborted request awaiting the server's END.
#[derive(Debug, Clone, Serialize)]
pub struct AbortedRequest {
    pub msgid: u32,
    pub method: String,
    pub nignored: u64,
}

/// Point-in-time introspection of a client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client_id: u64,
    pub label: String,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub nfatal: u64,
    pub pending: Vec<InflightRequest>,
    pub aborted: Vec<AbortedRequest>,
    pub recent: Vec<RequestOutcome>,
}

struct ClientState {
    alloc: MsgidAllocator,
    pending: HashMap<u32, Pending>,
    aborted: HashMap<u32, AbortedEntry>,
    recent: VecDeque<RequestOutcome>,
    detached: bool,
    fatal: Option<Arc<FastError>>,
}

struct ClientShared {
    client_id: u64,
    label: String,
    n_recent: usize,
    state: Mutex<ClientState>,
    out_tx: mpsc::UnboundedSender<FastMessage>,
    fatal_tx: watch::Sender<Option<Arc<FastError>>>,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    nfatal: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientShared {
    fn push_recent(&self, state: &mut ClientState, outcome: RequestOutcome) {
        if self.n_recent == 0 {
            return;
        }
        if state.recent.len() == self.n_recent {
            state.recent.pop_front();
        }
        state.recent.push_back(outcome);
    }

    /// Fail one pending request. The state lock must be held; `p` has
    /// already been removed from the pending table.
    fn fail_request(
        &self,
        state: &mut ClientState,
        msgid: u32,
        mut p: Pending,
        cause: Arc<FastError>,
        aborted: bool,
    ) {
        if let Some(timer) = p.timer.take() {
            timer.abort();
        }
        let err = FastRequestError::new(msgid, &p.method, cause);
        debug!(
            client_id = self.client_id,
            msgid,
            method = %p.method,
            error = %err,
            "rpc-done"
        );
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.push_recent(
            state,
            RequestOutcome {
                msgid,
                method: p.method.clone(),
                ndata: p.ndata,
                aborted,
                error: Some(err.cause().to_string()),
                duration: p.started.elapsed(),
            },
        );
        let _ = p.ev_tx.send(RequestEvent::Failed(err));
    }

    /// Route one decoded inbound message to its request.
    fn route(&self, msg: FastMessage) {
        let fatal = {
            let mut state = self.state.lock().unwrap();
            if state.detached || state.fatal.is_some() {
                return;
            }
            self.route_locked(&mut state, msg)
        };
        if let Some(err) = fatal {
            self.fatal(FastError::Protocol(err));
        }
    }

    fn route_locked(&self, state: &mut ClientState, msg: FastMessage) -> Option<ProtocolError> {
        let msgid = msg.msgid;

        if let Some(entry) = state.aborted.get_mut(&msgid) {
            if msg.status == MessageStatus::End {
                let entry = state.aborted.remove(&msgid).unwrap();
                trace!(
                    client_id = self.client_id,
                    msgid,
                    method = %entry.method,
                    nignored = entry.nignored,
                    "aborted request reaped by server END"
                );
            } else {
                entry.nignored += 1;
            }
            return None;
        }

        if !state.pending.contains_key(&msgid) {
            return Some(ProtocolError::UnknownMsgid { msgid });
        }

        match msg.status {
            MessageStatus::Data => {
                let p = state.pending.get_mut(&msgid).unwrap();
                if let Some(values) = msg.payload() {
                    for v in values {
                        p.ndata += 1;
                        trace!(client_id = self.client_id, msgid, "rpc-data");
                        let _ = p.ev_tx.send(RequestEvent::Data(v.clone()));
                    }
                } else {
                    debug!(
                        client_id = self.client_id,
                        msgid, "DATA message without an array payload; nothing to deliver"
                    );
                }
                p.last_message = Some(msg);
                None
            }
            MessageStatus::End => {
                let mut p = state.pending.remove(&msgid).unwrap();
                if let Some(timer) = p.timer.take() {
                    timer.abort();
                }
                if let Some(values) = msg.payload() {
                    for v in values {
                        p.ndata += 1;
                        trace!(client_id = self.client_id, msgid, "rpc-data");
                        let _ = p.ev_tx.send(RequestEvent::Data(v.clone()));
                    }
                }
                debug!(
                    client_id = self.client_id,
                    msgid,
                    method = %p.method,
                    ndata = p.ndata,
                    "rpc-done"
                );
                self.completed.fetch_add(1, Ordering::Relaxed);
                self.push_recent(
                    state,
                    RequestOutcome {
                        msgid,
                        method: p.method,
                        ndata: p.ndata,
                        aborted: false,
                        error: None,
                        duration: p.started.elapsed(),
                    },
                );
                let _ = p.ev_tx.send(RequestEvent::End);
                None
            }
            MessageStatus::Error => {
                // The decoder already validated the shape; re-check before
                // trusting it.
                let remote = match msg.error_payload().and_then(RemoteError::from_wire) {
                    Some(remote) => remote,
                    None => return Some(ProtocolError::BadErrorShape),
                };
                let p = state.pending.remove(&msgid).unwrap();
                let cause = Arc::new(FastError::Server(FastServerError::new(remote)));
                self.fail_request(state, msgid, p, cause, false);
                None
            }
        }
    }

    /// Record the first fatal engine error and fail every pending request
    /// with it. Later fatals are counted and logged only.
    fn fatal(&self, err: FastError) {
        let err = Arc::new(err);
        {
            let mut state = self.state.lock().unwrap();
            self.nfatal.fetch_add(1, Ordering::Relaxed);
            if state.detached || state.fatal.is_some() {
                debug!(
                    client_id = self.client_id,
                    error = %err,
                    "fatal error after engine already failed (ignored)"
                );
                return;
            }
            state.fatal = Some(err.clone());
            error!(
                client_id = self.client_id,
                name = err.name(),
                error = %err,
                "fatal client error"
            );
            let pending = std::mem::take(&mut state.pending);
            for (msgid, p) in pending {
                self.fail_request(&mut state, msgid, p, err.clone(), false);
            }
            state.aborted.clear();
        }
        self.fatal_tx.send_replace(Some(err));
        self.stop_tasks();
    }

    /// The transport hit end-of-stream. Benign when idle, fatal otherwise.
    fn transport_ended(&self) {
        let has_pending = {
            let state = self.state.lock().unwrap();
            if state.detached || state.fatal.is_some() {
                return;
            }
            !state.pending.is_empty()
        };
        if has_pending {
            self.fatal(FastError::Protocol(ProtocolError::UnexpectedEnd));
        } else {
            debug!(
                client_id = self.client_id,
                "transport ended with no requests pending"
            );
        }
    }

    /// Locally abort a pending request. No-op if it already completed.
    fn abort_request(&self, msgid: u32, cause: Option<FastError>) {
        let mut state = self.state.lock().unwrap();
        let Some(p) = state.pending.remove(&msgid) else {
            return;
        };
        state.aborted.insert(
            msgid,
            AbortedEntry {
                method: p.method.clone(),
                nignored: 0,
            },
        );
        let cause = Arc::new(FastError::Aborted(RequestAbortedError::new(cause)));
        self.fail_request(&mut state, msgid, p, cause, true);
    }

    fn detach(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.detached {
                return;
            }
            state.detached = true;
            debug!(client_id = self.client_id, "client detached from transport");
            let pending = std::mem::take(&mut state.pending);
            let cause = Arc::new(FastError::Transport(TransportError::detached()));
            for (msgid, p) in pending {
                self.fail_request(&mut state, msgid, p, cause.clone(), false);
            }
            state.aborted.clear();
        }
        self.stop_tasks();
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Handle for aborting a request from another task.
#[derive(Clone)]
pub struct RequestAborter {
    msgid: u32,
    shared: Arc<ClientShared>,
}

impl RequestAborter {
    pub fn abort(&self) {
        self.shared.abort_request(self.msgid, None);
    }
}

/// One in-flight RPC call: a stream of values and a single terminal.
///
/// The stream yields `Ok(value)` for each emitted value. A clean END shows up
/// as the end of the stream; any failure shows up as one `Err` item, after
/// which the stream is finished.
pub struct FastRequest {
    msgid: u32,
    method: String,
    shared: Arc<ClientShared>,
    rx: mpsc::UnboundedReceiver<RequestEvent>,
    done: bool,
}

impl FastRequest {
    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Abort this request locally. The server is not notified and may keep
    /// executing; its remaining messages for this msgid are discarded.
    pub fn abort(&self) {
        self.shared.abort_request(self.msgid, None);
    }

    pub fn abort_handle(&self) -> RequestAborter {
        RequestAborter {
            msgid: self.msgid,
            shared: self.shared.clone(),
        }
    }
}

impl Stream for FastRequest {
    type Item = Result<Value, FastRequestError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(RequestEvent::Data(v))) => Poll::Ready(Some(Ok(v))),
            Poll::Ready(Some(RequestEvent::Failed(err))) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(Some(RequestEvent::End)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The client engine.
pub struct FastClient {
    shared: Arc<ClientShared>,
}

impl FastClient {
    /// Attach a client to an established transport. The transport's read and
    /// write halves are driven by background tasks until the client is
    /// detached, dropped, or hits a fatal error.
    pub fn new<T>(config: FastClientConfig, transport: T) -> FastClient
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rd, wr) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (fatal_tx, _) = watch::channel(None);
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed) + 1;

        let shared = Arc::new(ClientShared {
            client_id,
            label: config.label.clone(),
            n_recent: config.n_recent_requests,
            state: Mutex::new(ClientState {
                alloc: MsgidAllocator::new(),
                pending: HashMap::new(),
                aborted: HashMap::new(),
                recent: VecDeque::new(),
                detached: false,
                fatal: None,
            }),
            out_tx,
            fatal_tx,
            started: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            nfatal: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        });
        debug!(client_id, label = %config.label, "client attached to transport");

        let writer = tokio::spawn(write_loop(
            wr,
            out_rx,
            MessageEncoder::new(config.crc_mode),
            shared.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            rd,
            FastFrameCodec::new(config.crc_mode, config.max_data_len),
            shared.clone(),
        ));
        shared.tasks.lock().unwrap().extend([writer, reader]);

        FastClient { shared }
    }

    pub fn client_id(&self) -> u64 {
        self.shared.client_id
    }

    /// Issue an RPC call. Never fails synchronously: when the client is
    /// detached or already failed, the returned stream delivers the failure
    /// on its first poll.
    pub fn rpc(&self, opts: RpcOptions) -> FastRequest {
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock().unwrap();
        let msgid = state.alloc.next();
        self.shared.started.fetch_add(1, Ordering::Relaxed);

        if state.detached || state.fatal.is_some() {
            let cause = match &state.fatal {
                Some(fatal) => fatal.clone(),
                None => Arc::new(FastError::Transport(TransportError::detached())),
            };
            let err = FastRequestError::new(msgid, &opts.method, cause);
            self.shared.failed.fetch_add(1, Ordering::Relaxed);
            let outcome = RequestOutcome {
                msgid,
                method: opts.method.clone(),
                ndata: 0,
                aborted: false,
                error: Some(err.cause().to_string()),
                duration: Duration::ZERO,
            };
            self.shared.push_recent(&mut state, outcome);
            let _ = ev_tx.send(RequestEvent::Failed(err));
            drop(state);
            return FastRequest {
                msgid,
                method: opts.method,
                shared: self.shared.clone(),
                rx: ev_rx,
                done: false,
            };
        }

        debug!(
            client_id = self.shared.client_id,
            msgid,
            method = %opts.method,
            args = ?opts.args,
            "rpc-start"
        );

        let timer = opts.timeout.map(|after| {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                shared.abort_request(msgid, Some(FastError::Timeout(TimeoutError { after })));
            })
        });

        state.pending.insert(
            msgid,
            Pending {
                method: opts.method.clone(),
                started: Instant::now(),
                ndata: 0,
                ev_tx,
                timer,
                last_message: None,
            },
        );
        drop(state);

        let msg = FastMessage::data(msgid, &opts.method, opts.args);
        // A closed queue means the writer already died; the fatal path takes
        // care of failing this request.
        let _ = self.shared.out_tx.send(msg);

        FastRequest {
            msgid,
            method: opts.method,
            shared: self.shared.clone(),
            rx: ev_rx,
            done: false,
        }
    }

    /// Detach from the transport: stop reading and writing and fail every
    /// pending request. Idempotent.
    pub fn detach(&self) {
        self.shared.detach();
    }

    /// Observe the first fatal engine error. The watch value transitions
    /// from `None` to `Some` at most once.
    pub fn subscribe_fatal(&self) -> watch::Receiver<Option<Arc<FastError>>> {
        self.shared.fatal_tx.subscribe()
    }

    /// The first fatal engine error, if one occurred.
    pub fn fatal_error(&self) -> Option<Arc<FastError>> {
        self.shared.state.lock().unwrap().fatal.clone()
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        let state = self.shared.state.lock().unwrap();
        let mut pending: Vec<InflightRequest> = state
            .pending
            .iter()
            .map(|(msgid, p)| InflightRequest {
                msgid: *msgid,
                method: p.method.clone(),
                ndata: p.ndata,
                age: p.started.elapsed(),
                last_status: p.last_message.as_ref().map(|m| m.status.label()),
            })
            .collect();
        pending.sort_by_key(|r| r.msgid);
        let mut aborted: Vec<AbortedRequest> = state
            .aborted
            .iter()
            .map(|(msgid, a)| AbortedRequest {
                msgid: *msgid,
                method: a.method.clone(),
                nignored: a.nignored,
            })
            .collect();
        aborted.sort_by_key(|r| r.msgid);
        ClientSnapshot {
            client_id: self.shared.client_id,
            label: self.shared.label.clone(),
            started: self.shared.started.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            nfatal: self.shared.nfatal.load(Ordering::Relaxed),
            pending,
            aborted,
            recent: state.recent.iter().cloned().collect(),
        }
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        // Dropping the handle detaches: pending requests fail rather than
        // hanging on a reader that no longer exists.
        self.shared.detach();
    }
}

async fn write_loop<W>(
    mut wr: W,
    mut rx: mpsc::UnboundedReceiver<FastMessage>,
    encoder: MessageEncoder,
    shared: Arc<ClientShared>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = rx.recv().await {
        let frame = match encoder.encode(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                shared.fatal(FastError::Encode(err));
                break;
            }
        };
        if let Err(err) = wr.write_all(&frame).await {
            shared.fatal(FastError::Transport(TransportError::io(err)));
            break;
        }
    }
}

async fn read_loop<R>(rd: R, codec: FastFrameCodec, shared: Arc<ClientShared>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(rd, codec);
    loop {
        match frames.next().await {
            Some(Ok(msg)) => shared.route(msg),
            Some(Err(err)) => {
                shared.fatal(err.into());
                break;
            }
            None => {
                shared.transport_ended();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn msgid_allocation_starts_at_one_and_skips_zero() {
        let mut alloc = MsgidAllocator::new();
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
        for _ in 0..1_000_000 {
            assert_ne!(alloc.next(), 0);
        }
        assert_eq!(alloc.next, 1_000_002);
    }

    #[test]
    fn msgid_allocation_wraps_to_one() {
        let mut alloc = MsgidAllocator { next: FP_MSGID_MAX - 2 };
        assert_eq!(alloc.next(), FP_MSGID_MAX - 1);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
    }

    /// A client over an in-memory duplex, plus the server end of the pipe
    /// for hand-written responses.
    fn duplex_client() -> (FastClient, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1 << 20);
        let client = FastClient::new(FastClientConfig::default(), near);
        (client, far)
    }

    async fn write_frame(far: &mut tokio::io::DuplexStream, msg: &FastMessage) {
        let frame = MessageEncoder::new(CrcMode::OldNew).encode(msg).unwrap();
        far.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn detach_fails_pending_requests() {
        let (client, _far) = duplex_client();
        let mut req = client.rpc(RpcOptions::new("slowmethod", vec![]));

        client.detach();
        client.detach(); // idempotent

        let err = req.next().await.unwrap().unwrap_err();
        assert_eq!(err.name(), "FastRequestError");
        assert_eq!(
            err.to_string(),
            "request failed: client detached from transport"
        );
        assert!(req.next().await.is_none());
    }

    #[tokio::test]
    async fn rpc_after_detach_fails_asynchronously() {
        let (client, _far) = duplex_client();
        client.detach();

        let mut req = client.rpc(RpcOptions::new("anything", vec![json!(1)]));
        let err = req.next().await.unwrap().unwrap_err();
        assert!(matches!(err.cause(), FastError::Transport(_)));
    }

    #[tokio::test]
    async fn end_with_values_delivers_then_finishes() {
        let (client, mut far) = duplex_client();
        let mut req = client.rpc(RpcOptions::new("testmethod", vec![json!("arg")]));
        let msgid = req.msgid();

        write_frame(&mut far, &FastMessage::data(msgid, "testmethod", vec![json!("a")])).await;
        write_frame(&mut far, &FastMessage::end(msgid, "testmethod", Some(json!("b")))).await;

        assert_eq!(req.next().await.unwrap().unwrap(), json!("a"));
        assert_eq!(req.next().await.unwrap().unwrap(), json!("b"));
        assert!(req.next().await.is_none());
        assert!(client.fatal_error().is_none());

        let snap = client.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.recent.len(), 1);
        assert_eq!(snap.recent[0].ndata, 2);
    }

    #[tokio::test]
    async fn abort_discards_messages_until_end() {
        let (client, mut far) = duplex_client();
        let mut req = client.rpc(RpcOptions::new("slowmethod", vec![]));
        let msgid = req.msgid();

        req.abort();
        let err = req.next().await.unwrap().unwrap_err();
        assert!(matches!(err.cause(), FastError::Aborted(_)));

        // Late server output for the aborted msgid is swallowed.
        write_frame(&mut far, &FastMessage::data(msgid, "slowmethod", vec![json!(1)])).await;
        write_frame(&mut far, &FastMessage::data(msgid, "slowmethod", vec![json!(2)])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = client.snapshot();
        assert_eq!(snap.aborted.len(), 1);
        assert_eq!(snap.aborted[0].nignored, 2);
        assert!(client.fatal_error().is_none());

        // The END reaps the aborted entry without a protocol error.
        write_frame(&mut far, &FastMessage::end(msgid, "slowmethod", None)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.fatal_error().is_none());
        assert!(client.snapshot().aborted.is_empty());
    }

    #[tokio::test]
    async fn abort_after_completion_is_a_noop() {
        let (client, mut far) = duplex_client();
        let mut req = client.rpc(RpcOptions::new("testmethod", vec![]));
        write_frame(&mut far, &FastMessage::end(req.msgid(), "testmethod", None)).await;
        assert!(req.next().await.is_none());

        req.abort();
        assert!(client.snapshot().aborted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_with_timeout_cause() {
        let (client, _far) = duplex_client();
        let mut req = client.rpc(
            RpcOptions::new("slowmethod", vec![]).with_timeout(Duration::from_millis(250)),
        );

        let err = req.next().await.unwrap().unwrap_err();
        let FastError::Aborted(aborted) = err.cause() else {
            panic!("expected aborted cause, got {err}");
        };
        use std::error::Error;
        let timeout = aborted.source().expect("timeout cause");
        assert_eq!(timeout.to_string(), "request timed out after 250ms");
    }

    #[tokio::test]
    async fn fatal_error_is_surfaced_once() {
        let (client, mut far) = duplex_client();
        let mut fatal_rx = client.subscribe_fatal();
        let mut req = client.rpc(RpcOptions::new("testmethod", vec![]));

        // A reply for a msgid that was never issued.
        write_frame(&mut far, &FastMessage::end(47, "testmethod", None)).await;

        let err = req.next().await.unwrap().unwrap_err();
        assert_eq!(
            err.cause().to_string(),
            "fast protocol: received message with unknown msgid 47"
        );

        fatal_rx.changed().await.unwrap();
        let fatal = fatal_rx.borrow().clone().unwrap();
        assert_eq!(fatal.name(), "FastProtocolError");

        let snap = client.snapshot();
        assert_eq!(snap.nfatal, 1);
        assert!(snap.pending.is_empty());
    }
}
