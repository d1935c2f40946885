//! Frame codec for the TCP link between agent and hub
//!
//! Frames are laid out as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ N bytes: protobuf Envelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Upper bound on a single frame body; anything larger is a protocol error
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Length prefix size in bytes
const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds maximum of {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("invalid frame length prefix: {0}")]
    InvalidLength(u32),

    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("protobuf encode error: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Encode an envelope into a length-prefixed frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let body_len = envelope.encoded_len();
    if body_len > MAX_FRAME_SIZE as usize {
        return Err(CodecError::FrameTooLarge(body_len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);
    buf.put_u32(body_len as u32);
    envelope.encode(&mut buf)?;

    Ok(buf.freeze())
}

/// Decode one complete frame from a buffer.
///
/// Returns `Ok(None)` while the buffer does not yet hold a whole frame;
/// nothing is consumed until a complete frame is available.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len > MAX_FRAME_SIZE {
        return Err(CodecError::InvalidLength(body_len));
    }

    if buf.len() < LENGTH_PREFIX_SIZE + body_len as usize {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(body_len as usize);
    let envelope = Envelope::decode(body.freeze())?;

    Ok(Some(envelope))
}

/// Incremental decoder holding bytes read off the socket until whole
/// frames are available
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append newly received bytes to the internal buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next complete frame.
    ///
    /// Call repeatedly until it returns `Ok(None)` to drain all buffered frames.
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Number of buffered bytes not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
