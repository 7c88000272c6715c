//! Length-prefixed framing
//!
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ len: u32 BE  │ JSON envelope (len bytes)    │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! The link below is trusted to deliver bytes in order; framing only
//! restores message boundaries.

use crate::{CodecError, Envelope, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

pub const FRAME_HEADER_SIZE: usize = 4;

/// Upper bound on a single envelope
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode one envelope as a length-prefixed frame
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes> {
    let payload = serde_json::to_vec(envelope).map_err(|e| CodecError::encode("envelope", e))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    trace!(cmd = envelope.cmd_name(), bytes = buf.len(), "Encoded frame");
    Ok(buf.freeze())
}

/// Decode exactly one complete frame
pub fn decode_frame(frame: &[u8]) -> Result<Envelope> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(CodecError::MessageTooSmall {
            need: FRAME_HEADER_SIZE,
            got: frame.len(),
            context: "frame header".to_string(),
        });
    }
    let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() < len {
        return Err(CodecError::MessageTooSmall {
            need: len,
            got: body.len(),
            context: "frame body".to_string(),
        });
    }
    serde_json::from_slice(&body[..len]).map_err(|e| CodecError::malformed("envelope", e))
}

/// Incremental decoder for a byte stream carrying many frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Next complete envelope, or `None` if more bytes are needed
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
            as usize;
        if len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size: len,
                limit: MAX_FRAME_SIZE,
            });
        }
        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        self.buffer.advance(FRAME_HEADER_SIZE);
        let body = self.buffer.split_to(len);
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| CodecError::malformed("envelope", e))
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
