//! Streaming-safe frame encoder/decoder.
//!
//! The decoder owns a growable buffer; callers append whatever the socket
//! yielded and pull zero or more complete frames out. Partial frames stay
//! buffered until the remainder arrives. Any protocol violation poisons the
//! decoder: the owning channel must be closed and the peer marked dead.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use super::frame::{Frame, FrameKind, DEFAULT_MAX_FRAME_SIZE, FRAME_OVERHEAD};

/// Errors raised while encoding or decoding frames.
#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
    /// A frame (or declared frame) exceeds the configured maximum.
    #[error("Frame of {size} bytes exceeds the {max} byte maximum")]
    OversizeFrame { size: usize, max: usize },

    /// The length prefix is smaller than the fixed frame overhead.
    #[error("Malformed frame length: {len}")]
    MalformedLength { len: u32 },

    /// The kind byte does not name a known frame kind.
    #[error("Unknown frame kind: 0x{kind:02X}")]
    UnknownKind { kind: u8 },

    /// A REQ/RESP payload failed to parse as its JSON record.
    #[error("Malformed frame payload: {message}")]
    MalformedPayload { message: String },
}

/// Encodes a frame into a fresh buffer.
///
/// Fails with [`CodecError::OversizeFrame`] when the encoded frame would
/// exceed `max_frame_size`; callers with larger bodies must stream them as
/// body chunks instead.
pub fn encode(frame: &Frame, max_frame_size: usize) -> Result<Bytes, CodecError> {
    let body_len = FRAME_OVERHEAD + frame.payload.len();
    if body_len > max_frame_size {
        return Err(CodecError::OversizeFrame {
            size: body_len,
            max: max_frame_size,
        });
    }
    let mut buf = BytesMut::with_capacity(4 + body_len);
    buf.put_u32(body_len as u32);
    buf.put_u8(frame.kind as u8);
    buf.put_slice(frame.correlation.as_bytes());
    buf.put_slice(&frame.payload);
    Ok(buf.freeze())
}

/// Incremental frame decoder over a byte stream.
///
/// ```
/// use bytes::Bytes;
/// use janus_rs::protocol::{codec, Frame, FrameDecoder, FrameKind};
/// use uuid::Uuid;
///
/// let frame = Frame::new(FrameKind::ReqBody, Uuid::new_v4(), Bytes::from_static(b"chunk"));
/// let wire = codec::encode(&frame, 1024).unwrap();
///
/// let mut decoder = FrameDecoder::new(1024);
/// decoder.extend(&wire);
/// let decoded = decoder.decode_next().unwrap().unwrap();
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_size,
        }
    }

    /// Appends raw bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Mutable access to the internal buffer, for `read_buf`-style fills.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Attempts to decode one complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. An `Err` is terminal:
    /// the stream can no longer be trusted to be frame-aligned.
    pub fn decode_next(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if (declared as usize) < FRAME_OVERHEAD {
            return Err(CodecError::MalformedLength { len: declared });
        }
        if declared as usize > self.max_frame_size {
            return Err(CodecError::OversizeFrame {
                size: declared as usize,
                max: self.max_frame_size,
            });
        }

        let total = 4 + declared as usize;
        if self.buf.len() < total {
            // Reserve up front so the read loop fills in larger chunks.
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(4);
        let kind_byte = self.buf.get_u8();
        let kind = FrameKind::from_wire(kind_byte)
            .ok_or(CodecError::UnknownKind { kind: kind_byte })?;

        let mut correlation = [0u8; 16];
        correlation.copy_from_slice(&self.buf[..16]);
        self.buf.advance(16);

        let payload = self
            .buf
            .split_to(declared as usize - FRAME_OVERHEAD)
            .freeze();

        Ok(Some(Frame {
            kind,
            correlation: Uuid::from_bytes(correlation),
            payload,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: FrameKind, payload: &'static [u8]) -> Frame {
        Frame::new(kind, Uuid::new_v4(), Bytes::from_static(payload))
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let original = frame(FrameKind::Req, b"{\"method\":\"GET\"}");
        let wire = encode(&original, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        let decoded = decoder.decode_next().unwrap().unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decode_handles_split_delivery() {
        let original = frame(FrameKind::RespBody, b"partial delivery payload");
        let wire = encode(&original, DEFAULT_MAX_FRAME_SIZE).unwrap();

        let mut decoder = FrameDecoder::default();
        for chunk in wire.chunks(3) {
            decoder.extend(chunk);
        }
        assert_eq!(decoder.decode_next().unwrap().unwrap(), original);
    }

    #[test]
    fn decode_yields_multiple_frames_from_one_fill() {
        let a = frame(FrameKind::Ping, b"");
        let b = frame(FrameKind::Pong, b"");
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&encode(&a, 1024).unwrap());
        wire.extend_from_slice(&encode(&b, 1024).unwrap());

        let mut decoder = FrameDecoder::new(1024);
        decoder.extend(&wire);
        assert_eq!(decoder.decode_next().unwrap().unwrap(), a);
        assert_eq!(decoder.decode_next().unwrap().unwrap(), b);
        assert_eq!(decoder.decode_next().unwrap(), None);
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let big = Frame::new(
            FrameKind::RespBody,
            Uuid::new_v4(),
            Bytes::from(vec![0u8; 100]),
        );
        let err = encode(&big, 64).unwrap_err();
        assert!(matches!(err, CodecError::OversizeFrame { .. }));
    }

    #[test]
    fn declared_oversize_is_rejected_before_buffering() {
        let mut decoder = FrameDecoder::new(64);
        decoder.extend(&(1_000_000u32).to_be_bytes());
        assert!(matches!(
            decoder.decode_next(),
            Err(CodecError::OversizeFrame { .. })
        ));
    }

    #[test]
    fn short_length_prefix_is_malformed() {
        let mut decoder = FrameDecoder::default();
        decoder.extend(&(5u32).to_be_bytes());
        decoder.extend(&[0u8; 5]);
        assert!(matches!(
            decoder.decode_next(),
            Err(CodecError::MalformedLength { len: 5 })
        ));
    }

    #[test]
    fn unknown_kind_is_terminal() {
        let mut wire = BytesMut::new();
        wire.put_u32(FRAME_OVERHEAD as u32);
        wire.put_u8(0x7F);
        wire.put_slice(&[0u8; 16]);

        let mut decoder = FrameDecoder::default();
        decoder.extend(&wire);
        assert!(matches!(
            decoder.decode_next(),
            Err(CodecError::UnknownKind { kind: 0x7F })
        ));
    }
}
