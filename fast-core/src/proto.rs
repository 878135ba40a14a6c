//! The Fast message model and wire-format constants.
//!
//! One message on the wire is a 13-byte header followed by a UTF-8 JSON
//! payload:
//!
//! ```text
//! +--------+------+--------+-----------+----------+-------------+---------+
//! | version| type | status |   msgid   |   crc    |   datalen   |  data   |
//! |  1 B   | 1 B  |  1 B   | 4 B (BE)  | 4 B (BE) |  4 B (BE)   |  N B    |
//! +--------+------+--------+-----------+----------+-------------+---------+
//! ```
//!
//! The payload is always a JSON object with two recognized members: `m`
//! (metadata: the RPC method `name` and an optional `uts` timestamp in
//! microseconds) and `d` (the data payload: an array of values for DATA and
//! END, an error description object for ERROR). Unrecognized members are
//! carried opaquely and round-trip unchanged.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};

use crate::error::RpcError;

/// Protocol version understood by this implementation.
pub const FP_VERSION_1: u8 = 0x1;
/// The version written into outbound frames.
pub const FP_VERSION_CURRENT: u8 = FP_VERSION_1;
/// The only defined payload encoding: UTF-8 JSON.
pub const FP_TYPE_JSON: u8 = 0x1;

/// Size of the fixed frame header in bytes.
pub const FP_HEADER_SZ: usize = 13;

pub(crate) const FP_OFF_VERSION: usize = 0;
pub(crate) const FP_OFF_TYPE: usize = 1;
pub(crate) const FP_OFF_STATUS: usize = 2;
pub(crate) const FP_OFF_MSGID: usize = 3;
pub(crate) const FP_OFF_CRC: usize = 7;
pub(crate) const FP_OFF_DATALEN: usize = 11;

/// Largest legal msgid. The high bit of the 32-bit wire field must be clear.
pub const FP_MSGID_MAX: u32 = (1 << 31) - 1;

/// Default cap on the payload length of a single frame (16 MiB).
pub const FP_DATA_LEN_MAX_DEFAULT: usize = 16 * 1024 * 1024;

/// The kind of a frame. Messages are a tagged variant over this status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageStatus {
    /// Carries payload values: arguments client-to-server, emitted values
    /// server-to-client.
    Data = 0x1,
    /// Terminates a request stream successfully, optionally carrying final
    /// values.
    End = 0x2,
    /// Terminates a request stream with a server-side failure description.
    Error = 0x3,
}

impl MessageStatus {
    /// Parse a wire status byte.
    pub fn from_wire(b: u8) -> Option<MessageStatus> {
        match b {
            0x1 => Some(MessageStatus::Data),
            0x2 => Some(MessageStatus::End),
            0x3 => Some(MessageStatus::Error),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Human-readable label used in events and diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            MessageStatus::Data => "DATA",
            MessageStatus::End => "END",
            MessageStatus::Error => "ERROR",
        }
    }
}

/// One decoded (or to-be-encoded) Fast message.
///
/// `data` is kept as a raw JSON object rather than a typed structure so that
/// fields this implementation does not interpret (`m.uts` on inbound
/// messages, `ase_errors` inside error descriptions, any future members)
/// survive a decode/encode round trip untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct FastMessage {
    pub msgid: u32,
    pub status: MessageStatus,
    pub data: Value,
}

impl FastMessage {
    /// Build a DATA message carrying `values`, stamped with the method name
    /// and the current time.
    pub fn data(msgid: u32, method: &str, values: Vec<Value>) -> FastMessage {
        FastMessage {
            msgid,
            status: MessageStatus::Data,
            data: json!({
                "m": { "name": method, "uts": now_micros() },
                "d": values,
            }),
        }
    }

    /// Build an END message, optionally carrying one final value.
    pub fn end(msgid: u32, method: &str, final_value: Option<Value>) -> FastMessage {
        let d = match final_value {
            Some(v) => vec![v],
            None => Vec::new(),
        };
        FastMessage {
            msgid,
            status: MessageStatus::End,
            data: json!({
                "m": { "name": method, "uts": now_micros() },
                "d": d,
            }),
        }
    }

    /// Build an ERROR message describing a server-side failure.
    pub fn error(msgid: u32, method: &str, err: &RpcError) -> FastMessage {
        FastMessage {
            msgid,
            status: MessageStatus::Error,
            data: json!({
                "m": { "name": method, "uts": now_micros() },
                "d": err.to_wire(),
            }),
        }
    }

    /// The RPC method name from `data.m.name`, if present.
    pub fn method_name(&self) -> Option<&str> {
        self.data.get("m")?.get("name")?.as_str()
    }

    /// The `data.d` payload as an array of values (DATA and END messages).
    pub fn payload(&self) -> Option<&Vec<Value>> {
        match self.data.get("d")? {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// The `data.d` payload as an error-description object (ERROR messages).
    pub fn error_payload(&self) -> Option<&Map<String, Value>> {
        match self.data.get("d")? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

/// Microseconds since the Unix epoch, for the `m.uts` stamp.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_round_trip() {
        for status in [MessageStatus::Data, MessageStatus::End, MessageStatus::Error] {
            assert_eq!(MessageStatus::from_wire(status.to_wire()), Some(status));
        }
        assert_eq!(MessageStatus::from_wire(0), None);
        assert_eq!(MessageStatus::from_wire(4), None);
    }

    #[test]
    fn data_message_shape() {
        let msg = FastMessage::data(7, "getobject", vec![json!({"bucket": "b1"})]);
        assert_eq!(msg.msgid, 7);
        assert_eq!(msg.status, MessageStatus::Data);
        assert_eq!(msg.method_name(), Some("getobject"));
        assert_eq!(msg.payload().unwrap().len(), 1);
        assert!(msg.data["m"]["uts"].as_u64().is_some());
    }

    #[test]
    fn end_message_payload() {
        let empty = FastMessage::end(3, "ping", None);
        assert_eq!(empty.payload().unwrap().len(), 0);

        let last = FastMessage::end(3, "ping", Some(json!("done")));
        assert_eq!(last.payload().unwrap(), &vec![json!("done")]);
    }

    #[test]
    fn error_message_shape() {
        let err = RpcError::named("DummyError", "dummy error message");
        let msg = FastMessage::error(9, "work", &err);
        let d = msg.error_payload().unwrap();
        assert_eq!(d["name"], "DummyError");
        assert_eq!(d["message"], "dummy error message");
    }

    #[test]
    fn unrecognized_members_are_preserved() {
        let msg = FastMessage {
            msgid: 1,
            status: MessageStatus::End,
            data: json!({"m": {"name": "x", "uts": 42, "extra": true}, "d": [], "z": 1}),
        };
        assert_eq!(msg.method_name(), Some("x"));
        assert_eq!(msg.data["z"], 1);
        assert_eq!(msg.data["m"]["extra"], true);
    }

    #[test]
    fn payload_accessors_reject_wrong_shapes() {
        let msg = FastMessage {
            msgid: 1,
            status: MessageStatus::Data,
            data: json!({"d": "not an array"}),
        };
        assert!(msg.payload().is_none());
        assert!(msg.error_payload().is_none());
        assert!(msg.method_name().is_none());
    }
}
