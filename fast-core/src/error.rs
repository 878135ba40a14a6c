//! Error taxonomy for the Fast engine.
//!
//! The names returned by the `name()` accessors appear on the wire (in ERROR
//! frames) and in emitted events, so they are part of the protocol contract
//! and must not change.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::proto::FP_MSGID_MAX;

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, FastError>;

/// A protocol-level violation: a malformed frame, an unknown msgid, or a
/// stream that ended where it must not. Fatal to the client engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The frame's version byte is not a version this implementation speaks.
    BadVersion { version: u8 },
    /// The frame's type byte is not the JSON encoding.
    BadType { mtype: u8 },
    /// The frame's status byte is not DATA, END, or ERROR.
    BadStatus { status: u8 },
    /// The msgid field has its high bit set.
    BadMsgid { msgid: u32 },
    /// The declared payload length exceeds the configured maximum.
    DataTooLong { datalen: usize, max: usize },
    /// The payload checksum does not match under any accepted CRC variant.
    ChecksumMismatch { declared: u32, computed: u16 },
    /// The payload is not valid JSON, or not a JSON object.
    InvalidJson { detail: String },
    /// An ERROR message whose `data.d` lacks the required error description.
    BadErrorShape,
    /// The byte stream ended partway through a frame.
    IncompleteMessage,
    /// A response arrived for a msgid with no pending or aborted request.
    UnknownMsgid { msgid: u32 },
    /// The transport ended while requests were still pending.
    UnexpectedEnd,
}

impl ProtocolError {
    pub fn name(&self) -> &'static str {
        "FastProtocolError"
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::BadVersion { version } => {
                write!(f, "fast protocol: unsupported version {version}")
            }
            ProtocolError::BadType { mtype } => {
                write!(f, "fast protocol: unsupported message type {mtype}")
            }
            ProtocolError::BadStatus { status } => {
                write!(f, "fast protocol: unsupported fast message status: {status}")
            }
            ProtocolError::BadMsgid { msgid } => {
                write!(f, "fast protocol: invalid msgid {msgid:#010x}")
            }
            ProtocolError::DataTooLong { datalen, max } => {
                write!(f, "fast protocol: data length {datalen} exceeds maximum {max}")
            }
            ProtocolError::ChecksumMismatch { declared, computed } => write!(
                f,
                "fast protocol: checksum mismatch (declared {declared}, computed {computed})"
            ),
            ProtocolError::InvalidJson { detail } => {
                write!(f, "fast protocol: invalid JSON in data: {detail}")
            }
            ProtocolError::BadErrorShape => write!(
                f,
                "fast protocol: data.d for ERROR messages must have name and message"
            ),
            ProtocolError::IncompleteMessage => {
                write!(f, "fast protocol: incomplete message at end-of-stream")
            }
            ProtocolError::UnknownMsgid { msgid } => {
                write!(f, "fast protocol: received message with unknown msgid {msgid}")
            }
            ProtocolError::UnexpectedEnd => write!(f, "unexpected end of transport stream"),
        }
    }
}

impl Error for ProtocolError {}

/// A failure of the underlying byte transport, or a deliberate detach.
#[derive(Debug)]
pub struct TransportError {
    message: String,
    source: Option<io::Error>,
}

impl TransportError {
    /// Wrap an I/O error surfaced by the transport.
    pub fn io(err: io::Error) -> TransportError {
        TransportError {
            message: "transport error".into(),
            source: Some(err),
        }
    }

    /// The caller detached the engine from its transport.
    pub fn detached() -> TransportError {
        TransportError {
            message: "client detached from transport".into(),
            source: None,
        }
    }

    pub fn name(&self) -> &'static str {
        "TransportError"
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{}: {src}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e as &(dyn Error + 'static))
    }
}

/// The failure description a server put into an ERROR frame, verbatim.
///
/// `info`, `context`, and `ase_errors` are carried opaquely; this
/// implementation never interprets them.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    pub info: Option<Value>,
    pub context: Option<Value>,
    pub ase_errors: Option<Value>,
}

impl RemoteError {
    /// Parse the `data.d` object of an ERROR message. Returns `None` when
    /// `name` or `message` is missing or not a string.
    pub fn from_wire(d: &Map<String, Value>) -> Option<RemoteError> {
        let name = d.get("name")?.as_str()?.to_string();
        let message = d.get("message")?.as_str()?.to_string();
        Some(RemoteError {
            name,
            message,
            info: d.get("info").cloned(),
            context: d.get("context").cloned(),
            ase_errors: d.get("ase_errors").cloned(),
        })
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for RemoteError {}

/// Client-side wrapper around an ERROR frame received from the server. The
/// remote failure is exposed as this error's source.
#[derive(Debug, Clone)]
pub struct FastServerError {
    remote: RemoteError,
}

impl FastServerError {
    pub fn new(remote: RemoteError) -> FastServerError {
        FastServerError { remote }
    }

    pub fn name(&self) -> &'static str {
        "FastServerError"
    }

    /// The server-supplied failure description.
    pub fn remote(&self) -> &RemoteError {
        &self.remote
    }
}

impl fmt::Display for FastServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error: {}", self.remote.message)
    }
}

impl Error for FastServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.remote)
    }
}

/// The request was terminated locally before the server finished it.
#[derive(Debug)]
pub struct RequestAbortedError {
    cause: Option<Box<FastError>>,
}

impl RequestAbortedError {
    pub fn new(cause: Option<FastError>) -> RequestAbortedError {
        RequestAbortedError {
            cause: cause.map(Box::new),
        }
    }

    pub fn name(&self) -> &'static str {
        "RequestAbortedError"
    }
}

impl fmt::Display for RequestAbortedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request aborted")
    }
}

impl Error for RequestAbortedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn Error + 'static))
    }
}

/// A per-request timer fired before the server finished the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    pub after: Duration,
}

impl TimeoutError {
    pub fn name(&self) -> &'static str {
        "TimeoutError"
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request timed out after {}ms", self.after.as_millis())
    }
}

impl Error for TimeoutError {}

/// An outbound message could not be validated or serialized.
#[derive(Debug)]
pub enum EncodeError {
    /// The msgid is outside the legal range.
    InvalidMsgid { msgid: u32 },
    /// The message data is not a JSON object.
    InvalidData,
    /// The message data could not be serialized to JSON.
    Serialize(serde_json::Error),
    /// Writing the encoded frame to the transport failed.
    Io(io::Error),
}

impl EncodeError {
    pub fn name(&self) -> &'static str {
        "EncodeError"
    }
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::InvalidMsgid { msgid } => write!(
                f,
                "msgid is not an integer between 0 and FP_MSGID_MAX ({FP_MSGID_MAX}): got {msgid}"
            ),
            EncodeError::InvalidData => write!(f, "data (object) is required"),
            EncodeError::Serialize(e) => {
                write!(f, "fast message data cannot be serialized: {e}")
            }
            EncodeError::Io(e) => write!(f, "frame write failed: {e}"),
        }
    }
}

impl Error for EncodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EncodeError::Serialize(e) => Some(e),
            EncodeError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for EncodeError {
    fn from(err: serde_json::Error) -> EncodeError {
        EncodeError::Serialize(err)
    }
}

impl From<io::Error> for EncodeError {
    fn from(err: io::Error) -> EncodeError {
        EncodeError::Io(err)
    }
}

/// Streaming-decoder failure: either a protocol violation in the byte stream
/// or an I/O error from the transport underneath it.
#[derive(Debug)]
pub enum DecodeError {
    Protocol(ProtocolError),
    Io(io::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Protocol(e) => write!(f, "{e}"),
            DecodeError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl Error for DecodeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DecodeError::Protocol(e) => Some(e),
            DecodeError::Io(e) => Some(e),
        }
    }
}

impl From<ProtocolError> for DecodeError {
    fn from(err: ProtocolError) -> DecodeError {
        DecodeError::Protocol(err)
    }
}

impl From<io::Error> for DecodeError {
    fn from(err: io::Error) -> DecodeError {
        DecodeError::Io(err)
    }
}

/// Any engine-level failure. The variant names map one-to-one onto the
/// protocol's error names via [`FastError::name`].
#[derive(Debug)]
pub enum FastError {
    Protocol(ProtocolError),
    Transport(TransportError),
    Server(FastServerError),
    Aborted(RequestAbortedError),
    Timeout(TimeoutError),
    Encode(EncodeError),
}

impl FastError {
    pub fn name(&self) -> &'static str {
        match self {
            FastError::Protocol(e) => e.name(),
            FastError::Transport(e) => e.name(),
            FastError::Server(e) => e.name(),
            FastError::Aborted(e) => e.name(),
            FastError::Timeout(e) => e.name(),
            FastError::Encode(e) => e.name(),
        }
    }

    /// The server-error wrapper, when this failure came from an ERROR frame.
    pub fn as_server_error(&self) -> Option<&FastServerError> {
        match self {
            FastError::Server(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            FastError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for FastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastError::Protocol(e) => write!(f, "{e}"),
            FastError::Transport(e) => write!(f, "{e}"),
            FastError::Server(e) => write!(f, "{e}"),
            FastError::Aborted(e) => write!(f, "{e}"),
            FastError::Timeout(e) => write!(f, "{e}"),
            FastError::Encode(e) => write!(f, "{e}"),
        }
    }
}

impl Error for FastError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FastError::Protocol(_) => None,
            FastError::Transport(e) => e.source(),
            FastError::Server(e) => e.source(),
            FastError::Aborted(e) => e.source(),
            FastError::Timeout(_) => None,
            FastError::Encode(e) => e.source(),
        }
    }
}

impl From<ProtocolError> for FastError {
    fn from(err: ProtocolError) -> FastError {
        FastError::Protocol(err)
    }
}

impl From<TransportError> for FastError {
    fn from(err: TransportError) -> FastError {
        FastError::Transport(err)
    }
}

impl From<FastServerError> for FastError {
    fn from(err: FastServerError) -> FastError {
        FastError::Server(err)
    }
}

impl From<EncodeError> for FastError {
    fn from(err: EncodeError) -> FastError {
        FastError::Encode(err)
    }
}

impl From<DecodeError> for FastError {
    fn from(err: DecodeError) -> FastError {
        match err {
            DecodeError::Protocol(e) => FastError::Protocol(e),
            DecodeError::Io(e) => FastError::Transport(TransportError::io(e)),
        }
    }
}

/// The top-level failure delivered to the caller of `rpc()`. Always wraps a
/// deeper cause.
#[derive(Debug, Clone)]
pub struct FastRequestError {
    msgid: u32,
    method: String,
    cause: Arc<FastError>,
}

impl FastRequestError {
    pub fn new(msgid: u32, method: &str, cause: Arc<FastError>) -> FastRequestError {
        FastRequestError {
            msgid,
            method: method.to_string(),
            cause,
        }
    }

    pub fn name(&self) -> &'static str {
        "FastRequestError"
    }

    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn cause(&self) -> &FastError {
        &self.cause
    }

    /// Structured details: always `rpcMsgid` and `rpcMethod`, merged with the
    /// server-supplied `info` when the cause is a server error.
    pub fn info(&self) -> Map<String, Value> {
        let mut info = Map::new();
        if let FastError::Server(se) = self.cause.as_ref() {
            if let Some(Value::Object(remote_info)) = &se.remote().info {
                for (k, v) in remote_info {
                    info.insert(k.clone(), v.clone());
                }
            }
        }
        info.insert("rpcMsgid".into(), Value::from(self.msgid));
        info.insert("rpcMethod".into(), Value::from(self.method.clone()));
        info
    }
}

impl fmt::Display for FastRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed: {}", self.cause)
    }
}

impl Error for FastRequestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// A failure reported by a server-side RPC handler. This is what gets
/// serialized into an ERROR frame's `data.d`.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub name: String,
    pub message: String,
    pub info: Option<Value>,
    pub context: Option<Value>,
}

impl RpcError {
    /// A generic server failure, named `FastError` on the wire.
    pub fn new(message: impl Into<String>) -> RpcError {
        RpcError::named("FastError", message)
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> RpcError {
        RpcError {
            name: name.into(),
            message: message.into(),
            info: None,
            context: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> RpcError {
        self.info = Some(info);
        self
    }

    pub fn with_context(mut self, context: Value) -> RpcError {
        self.context = Some(context);
        self
    }

    /// The ERROR-frame payload shape.
    pub fn to_wire(&self) -> Value {
        let mut d = Map::new();
        d.insert("name".into(), Value::from(self.name.clone()));
        d.insert("message".into(), Value::from(self.message.clone()));
        if let Some(info) = &self.info {
            d.insert("info".into(), info.clone());
        }
        if let Some(context) = &self.context {
            d.insert("context".into(), context.clone());
        }
        Value::Object(d)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Error for RpcError {}

/// An RPC method name was registered twice on the same server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationError {
    pub method: String,
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC method already registered: {}", self.method)
    }
}

impl Error for RegistrationError {}
