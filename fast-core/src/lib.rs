//! Core library for the Fast protocol: a framed, streaming, JSON-based RPC
//! protocol that multiplexes many concurrent request/response streams over a
//! single reliable byte transport.
//!
//! The pieces, leaves first:
//!
//! - [`crc`]: the two CRC-16 variants (conformant, and the legacy buggy one
//!   deployed peers still emit) plus the [`CrcMode`] compatibility switch.
//! - [`proto`]: the message model and wire constants.
//! - [`codec`]: the frame encoder and the chunk-tolerant streaming decoder.
//! - [`client`]: [`FastClient`], which issues calls and demultiplexes
//!   responses into per-request streams.
//! - [`server`]: [`FastServer`], which dispatches inbound calls to
//!   registered handlers with flow-controlled output and graceful shutdown.
//! - [`error`]: the shared error taxonomy.
//!
//! The engine consumes an already-established transport and emits structured
//! `tracing` events; connecting, TLS, and log backends are the caller's
//! business.

pub mod client;
pub mod codec;
pub mod crc;
pub mod error;
pub mod proto;
pub mod server;

pub use client::{
    ClientSnapshot, FastClient, FastClientConfig, FastRequest, RequestAborter, RpcOptions,
};
pub use codec::{FastFrameCodec, MessageEncoder};
pub use crc::CrcMode;
pub use error::{
    DecodeError, EncodeError, FastError, FastRequestError, FastServerError, ProtocolError,
    RegistrationError, RemoteError, RequestAbortedError, RpcError, TimeoutError, TransportError,
};
pub use proto::{FastMessage, MessageStatus, FP_DATA_LEN_MAX_DEFAULT, FP_MSGID_MAX};
pub use server::{FastServer, FastServerConfig, RpcContext, RpcHandler, ServerSnapshot};
