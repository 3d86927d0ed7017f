//! Frame struct and body decoding helpers.
//!
//! A frame is a tag plus an opaque body. Bodies are parsed with
//! [`BodyReader`], which turns every truncation into a protocol error.
//!
//! # Example
//!
//! ```
//! use muxwire::protocol::{build_frame, tags, FrameBuffer};
//!
//! let bytes = build_frame(tags::CLIENT_CLOSED, &7i32.to_be_bytes());
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&bytes).unwrap();
//!
//! assert_eq!(frames[0].tag, tags::CLIENT_CLOSED);
//! assert_eq!(frames[0].reader().read_i32().unwrap(), 7);
//! ```

use bytes::{Buf, Bytes};

use super::mutf8;
use super::wire_format::{tags, Header, HEADER_SIZE};
use crate::error::{MuxwireError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame tag.
    pub tag: u8,
    /// Body bytes following the tag (zero-copy via `bytes::Bytes`).
    pub body: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(tag: u8, body: Bytes) -> Self {
        Self { tag, body }
    }

    /// Tag name for logging.
    #[inline]
    pub fn tag_name(&self) -> &'static str {
        tags::name(self.tag)
    }

    /// Body length.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Start reading the body from the beginning.
    pub fn reader(&self) -> BodyReader {
        BodyReader::new(self.body.clone())
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&Header::new(tag, body.len()).encode());
    buf.extend_from_slice(body);
    buf
}

/// Cursor over a frame body.
#[derive(Debug, Clone)]
pub struct BodyReader {
    body: Bytes,
}

impl BodyReader {
    pub fn new(body: Bytes) -> Self {
        Self { body }
    }

    /// Read a big-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.body.get_i32())
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.body.get_u8())
    }

    /// Read a NUL-terminated modified UTF-8 string.
    pub fn read_cstring(&mut self) -> Result<String> {
        let (s, used) = mutf8::decode_terminated(&self.body)?;
        self.body.advance(used);
        Ok(s)
    }

    /// Read the rest of the body as a modified UTF-8 string.
    pub fn read_string_to_end(&mut self) -> Result<String> {
        let s = mutf8::decode(&self.body)?;
        self.body.clear();
        Ok(s)
    }

    /// Read exactly `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        self.need(n, "byte run")?;
        Ok(self.body.split_to(n))
    }

    /// Take everything that has not been read yet.
    pub fn remaining(self) -> Bytes {
        self.body
    }

    /// Unread byte count.
    #[inline]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.body.len() < n {
            return Err(MuxwireError::Protocol(format!(
                "Truncated frame body: need {} bytes for {}, have {}",
                n,
                what,
                self.body.len()
            )));
        }
        Ok(())
    }
}
