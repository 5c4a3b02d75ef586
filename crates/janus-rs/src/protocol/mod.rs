//! The length-prefixed IPC wire protocol.
//!
//! Everything that crosses a Janus Unix socket, gateway to worker or worker
//! to vault, is a frame:
//!
//! ```text
//! [len: u32 big-endian][kind: u8][correlation: 16 bytes][payload: len - 17 bytes]
//! ```
//!
//! `len` counts the kind byte, the correlation id, and the payload. REQ and
//! RESP payloads are JSON records ([`RequestRecord`] / [`ResponseRecord`]);
//! body frames carry raw bytes. A malformed length or unknown kind is not
//! recoverable: the channel is torn down and the peer treated as dead.
//!
//! - [`frame`] - Frame model, kinds, and the REQ/RESP payload records
//! - [`codec`] - Streaming-safe encoder/decoder over byte buffers

pub mod codec;
pub mod frame;

pub use codec::{CodecError, FrameDecoder};
pub use frame::{Frame, FrameKind, RequestRecord, ResponseRecord, FRAME_OVERHEAD};
