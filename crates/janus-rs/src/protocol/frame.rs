//! Frame model for the IPC protocol.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bytes of a frame that are not payload: kind byte plus correlation id.
pub const FRAME_OVERHEAD: usize = 17;

/// Default upper bound on a single frame. Larger bodies must stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Discriminant byte for each frame kind.
///
/// The numeric values are part of the wire contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Request head: JSON [`RequestRecord`] payload.
    Req = 0x01,
    /// Response head: JSON [`ResponseRecord`] payload.
    Resp = 0x02,
    /// Raw request body chunk.
    ReqBody = 0x03,
    /// Raw response body chunk.
    RespBody = 0x04,
    /// Request body terminator (empty payload).
    ReqEnd = 0x05,
    /// Response body terminator (empty payload).
    RespEnd = 0x06,
    /// The sender gave up on this correlation; abort at next suspension.
    Cancel = 0x07,
    Ping = 0x08,
    Pong = 0x09,
    /// Worker handshake after startup; payload is the worker id as text.
    WorkerReady = 0x0A,
    /// Stop taking new work, finish what is in flight.
    Drain = 0x0B,
}

impl FrameKind {
    /// Parses a wire discriminant. `None` for unknown bytes, which the codec
    /// treats as a protocol violation.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(FrameKind::Req),
            0x02 => Some(FrameKind::Resp),
            0x03 => Some(FrameKind::ReqBody),
            0x04 => Some(FrameKind::RespBody),
            0x05 => Some(FrameKind::ReqEnd),
            0x06 => Some(FrameKind::RespEnd),
            0x07 => Some(FrameKind::Cancel),
            0x08 => Some(FrameKind::Ping),
            0x09 => Some(FrameKind::Pong),
            0x0A => Some(FrameKind::WorkerReady),
            0x0B => Some(FrameKind::Drain),
            _ => None,
        }
    }
}

/// One unit of inter-process communication.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    /// Pairs REQ with RESP and scopes body chunks to their stream.
    pub correlation: Uuid,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, correlation: Uuid, payload: Bytes) -> Self {
        Self {
            kind,
            correlation,
            payload,
        }
    }

    /// A control frame with no payload.
    pub fn control(kind: FrameKind, correlation: Uuid) -> Self {
        Self::new(kind, correlation, Bytes::new())
    }

    /// Total encoded size including the 4-byte length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + FRAME_OVERHEAD + self.payload.len()
    }
}

/// JSON payload of a REQ frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    pub peer_ip: String,
    /// Absolute deadline as Unix milliseconds; the worker aborts past it.
    pub deadline_ms: u64,
}

impl RequestRecord {
    /// First header value matching `name`, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// JSON payload of a RESP frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_discriminants_are_fixed() {
        assert_eq!(FrameKind::Req as u8, 0x01);
        assert_eq!(FrameKind::Resp as u8, 0x02);
        assert_eq!(FrameKind::ReqBody as u8, 0x03);
        assert_eq!(FrameKind::RespBody as u8, 0x04);
        assert_eq!(FrameKind::ReqEnd as u8, 0x05);
        assert_eq!(FrameKind::RespEnd as u8, 0x06);
        assert_eq!(FrameKind::Cancel as u8, 0x07);
        assert_eq!(FrameKind::Ping as u8, 0x08);
        assert_eq!(FrameKind::Pong as u8, 0x09);
        assert_eq!(FrameKind::WorkerReady as u8, 0x0A);
        assert_eq!(FrameKind::Drain as u8, 0x0B);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(FrameKind::from_wire(0x00), None);
        assert_eq!(FrameKind::from_wire(0x0C), None);
        assert_eq!(FrameKind::from_wire(0xFF), None);
    }

    #[test]
    fn request_record_header_lookup_is_case_insensitive() {
        let record = RequestRecord {
            method: "GET".to_string(),
            path: "/".to_string(),
            query: vec![],
            headers: vec![("X-Janus-Session".to_string(), "tok".to_string())],
            peer_ip: "127.0.0.1".to_string(),
            deadline_ms: 0,
        };
        assert_eq!(record.header("x-janus-session"), Some("tok"));
        assert_eq!(record.header("missing"), None);
    }
}
