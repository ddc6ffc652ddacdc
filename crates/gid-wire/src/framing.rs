//! Length-prefixed framing for reliable frame delimiting over a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;

/// Default maximum frame size (16MB), large enough for file frames
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Framing error
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Frame too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),

    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Length-prefixed frame codec
#[derive(Debug, Clone, Copy)]
pub struct LengthCodec {
    max_frame_size: usize,
}

impl Default for LengthCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl LengthCodec {
    /// Create a new codec with the specified maximum frame size
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode data with length prefix
    /// Format: length (4 bytes BE) || data
    pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>, FramingError> {
        if data.len() > self.max_frame_size {
            return Err(FramingError::TooLarge(data.len(), self.max_frame_size));
        }

        let mut encoded = Vec::with_capacity(LENGTH_PREFIX_LEN + data.len());
        encoded.put_u32(data.len() as u32);
        encoded.extend_from_slice(data);
        Ok(encoded)
    }

    /// Decode a single complete frame
    pub fn decode(&self, framed: &[u8]) -> Result<Vec<u8>, FramingError> {
        if framed.len() < LENGTH_PREFIX_LEN {
            return Err(FramingError::Incomplete(LENGTH_PREFIX_LEN - framed.len()));
        }

        let mut buf = framed;
        let len = buf.get_u32() as usize;

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.remaining() < len {
            return Err(FramingError::Incomplete(len - buf.remaining()));
        }

        Ok(buf[..len].to_vec())
    }

    /// Streaming decoder for partial reads.
    /// Returns Some(data) when a complete frame is available, None if more data needed.
    /// Call repeatedly: one read may carry several frames.
    pub fn decode_stream(&self, buf: &mut BytesMut) -> Result<Option<Vec<u8>>, FramingError> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        let len = {
            let mut len_buf = &buf[..LENGTH_PREFIX_LEN];
            len_buf.get_u32() as usize
        };

        if len > self.max_frame_size {
            return Err(FramingError::TooLarge(len, self.max_frame_size));
        }

        if buf.len() < LENGTH_PREFIX_LEN + len {
            buf.reserve(LENGTH_PREFIX_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        let frame = buf.split_to(len).to_vec();
        Ok(Some(frame))
    }
}
