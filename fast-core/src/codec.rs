//! Frame encoder and streaming frame decoder.
//!
//! The decoder is a [`tokio_util::codec::Decoder`], so it can be driven by a
//! `FramedRead` over any byte stream and tolerates arbitrary chunk
//! boundaries: it accumulates the 13-byte header, validates it, then
//! accumulates exactly `datalen` payload bytes, verifies the checksum, and
//! parses the JSON payload. After the first protocol violation the decoder
//! is poisoned and emits nothing further.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::crc::CrcMode;
use crate::error::{DecodeError, EncodeError, ProtocolError};
use crate::proto::{
    FastMessage, MessageStatus, FP_DATA_LEN_MAX_DEFAULT, FP_HEADER_SZ, FP_MSGID_MAX,
    FP_OFF_CRC, FP_OFF_DATALEN, FP_OFF_MSGID, FP_OFF_STATUS, FP_OFF_TYPE, FP_OFF_VERSION,
    FP_TYPE_JSON, FP_VERSION_1, FP_VERSION_CURRENT,
};

/// Serializes one message into one contiguous frame.
#[derive(Debug, Clone)]
pub struct MessageEncoder {
    crc_mode: CrcMode,
}

impl MessageEncoder {
    pub fn new(crc_mode: CrcMode) -> MessageEncoder {
        MessageEncoder { crc_mode }
    }

    /// Validate and encode `msg`, returning the complete frame.
    pub fn encode(&self, msg: &FastMessage) -> Result<Bytes, EncodeError> {
        if msg.msgid > FP_MSGID_MAX {
            return Err(EncodeError::InvalidMsgid { msgid: msg.msgid });
        }
        if !msg.data.is_object() {
            return Err(EncodeError::InvalidData);
        }

        let payload = serde_json::to_vec(&msg.data)?;
        let crc = self.crc_mode.emit(&payload);

        let mut buf = BytesMut::with_capacity(FP_HEADER_SZ + payload.len());
        buf.put_u8(FP_VERSION_CURRENT);
        buf.put_u8(FP_TYPE_JSON);
        buf.put_u8(msg.status.to_wire());
        buf.put_u32(msg.msgid);
        buf.put_u32(u32::from(crc));
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }
}

/// A validated frame header awaiting its payload.
#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    status: MessageStatus,
    msgid: u32,
    crc: u32,
    datalen: usize,
}

/// Streaming decoder (and encoder) for Fast frames.
#[derive(Debug)]
pub struct FastFrameCodec {
    crc_mode: CrcMode,
    max_data_len: usize,
    encoder: MessageEncoder,
    pending: Option<FrameHeader>,
    failed: bool,
}

impl FastFrameCodec {
    pub fn new(crc_mode: CrcMode, max_data_len: usize) -> FastFrameCodec {
        FastFrameCodec {
            crc_mode,
            max_data_len,
            encoder: MessageEncoder::new(crc_mode),
            pending: None,
            failed: false,
        }
    }

    /// Parse and validate the fixed header at the start of `src`.
    fn read_header(&self, src: &[u8]) -> Result<FrameHeader, ProtocolError> {
        let version = src[FP_OFF_VERSION];
        if version != FP_VERSION_1 {
            return Err(ProtocolError::BadVersion { version });
        }
        let mtype = src[FP_OFF_TYPE];
        if mtype != FP_TYPE_JSON {
            return Err(ProtocolError::BadType { mtype });
        }
        let status = MessageStatus::from_wire(src[FP_OFF_STATUS])
            .ok_or(ProtocolError::BadStatus {
                status: src[FP_OFF_STATUS],
            })?;
        let msgid = u32::from_be_bytes(src[FP_OFF_MSGID..FP_OFF_MSGID + 4].try_into().unwrap());
        if msgid > FP_MSGID_MAX {
            return Err(ProtocolError::BadMsgid { msgid });
        }
        let crc = u32::from_be_bytes(src[FP_OFF_CRC..FP_OFF_CRC + 4].try_into().unwrap());
        let datalen =
            u32::from_be_bytes(src[FP_OFF_DATALEN..FP_OFF_DATALEN + 4].try_into().unwrap())
                as usize;
        if datalen > self.max_data_len {
            return Err(ProtocolError::DataTooLong {
                datalen,
                max: self.max_data_len,
            });
        }
        Ok(FrameHeader {
            status,
            msgid,
            crc,
            datalen,
        })
    }

    /// Verify and parse a complete payload into a message.
    fn read_payload(
        &self,
        header: FrameHeader,
        payload: &[u8],
    ) -> Result<FastMessage, ProtocolError> {
        if !self.crc_mode.accepts(payload, header.crc) {
            return Err(ProtocolError::ChecksumMismatch {
                declared: header.crc,
                computed: self.crc_mode.emit(payload),
            });
        }

        let data: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::InvalidJson {
                detail: e.to_string(),
            })?;
        if !data.is_object() {
            return Err(ProtocolError::InvalidJson {
                detail: "payload is not an object".into(),
            });
        }

        let msg = FastMessage {
            msgid: header.msgid,
            status: header.status,
            data,
        };

        if msg.status == MessageStatus::Error {
            let shape_ok = msg
                .error_payload()
                .is_some_and(|d| {
                    d.get("name").is_some_and(serde_json::Value::is_string)
                        && d.get("message").is_some_and(serde_json::Value::is_string)
                });
            if !shape_ok {
                return Err(ProtocolError::BadErrorShape);
            }
        }

        Ok(msg)
    }

    fn fail(&mut self, err: ProtocolError) -> DecodeError {
        self.failed = true;
        DecodeError::Protocol(err)
    }
}

impl Default for FastFrameCodec {
    fn default() -> FastFrameCodec {
        FastFrameCodec::new(CrcMode::default(), FP_DATA_LEN_MAX_DEFAULT)
    }
}

impl Decoder for FastFrameCodec {
    type Item = FastMessage;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FastMessage>, DecodeError> {
        // Poisoned: the first error was already reported, consume quietly.
        if self.failed {
            src.clear();
            return Ok(None);
        }

        if self.pending.is_none() {
            if src.len() < FP_HEADER_SZ {
                return Ok(None);
            }
            let header = match self.read_header(&src[..FP_HEADER_SZ]) {
                Ok(h) => h,
                Err(e) => return Err(self.fail(e)),
            };
            src.advance(FP_HEADER_SZ);
            src.reserve(header.datalen);
            self.pending = Some(header);
        }

        let header = self.pending.expect("header read above");
        if src.len() < header.datalen {
            return Ok(None);
        }
        let payload = src.split_to(header.datalen);
        self.pending = None;

        match self.read_payload(header, &payload) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<FastMessage>, DecodeError> {
        if self.failed {
            src.clear();
            return Ok(None);
        }
        match self.decode(src)? {
            Some(msg) => Ok(Some(msg)),
            None => {
                if self.pending.is_some() || !src.is_empty() {
                    Err(self.fail(ProtocolError::IncompleteMessage))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

impl Encoder<FastMessage> for FastFrameCodec {
    type Error = EncodeError;

    fn encode(&mut self, msg: FastMessage, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let frame = self.encoder.encode(&msg)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
