//! Incremental frame extraction from a byte stream.
//!
//! Reads from the channel arrive in arbitrary pieces. The buffer keeps the
//! unconsumed bytes in a `BytesMut` and alternates between two states:
//! - `Header`: fewer than five bytes (length + tag) are buffered
//! - `Body`: the header is consumed, `remaining` body bytes are due
//!
//! Frame bodies are split off the buffer without copying.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::protocol::FrameBuffer;
//!
//! let mut frames = FrameBuffer::new();
//! for frame in frames.push(&bytes_from_socket)? {
//!     handler.handle_frame(frame).await?;
//! }
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Header,
    Body { tag: u8, remaining: usize },
}

/// Turns arbitrary read chunks into complete [`Frame`]s.
pub struct FrameBuffer {
    unread: BytesMut,
    expect: Expect,
    /// Largest accepted value of the length field.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// 64 KiB initial capacity, 1 MiB frame limit.
    pub fn new() -> Self {
        Self::with_capacity_and_max_frame(64 * 1024, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_capacity_and_max_frame(capacity: usize, max_frame_size: u32) -> Self {
        Self {
            unread: BytesMut::with_capacity(capacity),
            expect: Expect::Header,
            max_frame_size,
        }
    }

    /// Append `data` and return every frame it completes, in order.
    ///
    /// A trailing partial frame stays buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a declared length is zero or exceeds
    /// `max_frame_size`. The stream cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.unread.extend_from_slice(data);
        std::iter::from_fn(|| self.next_frame().transpose()).collect()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.expect == Expect::Header {
            let Some(header) = Header::decode(&self.unread) else {
                return Ok(None);
            };
            header.validate(self.max_frame_size)?;
            self.unread.advance(HEADER_SIZE);
            self.expect = Expect::Body {
                tag: header.tag,
                remaining: header.body_len(),
            };
        }

        match self.expect {
            Expect::Body { tag, remaining } if self.unread.len() >= remaining => {
                let body = self.unread.split_to(remaining).freeze();
                self.expect = Expect::Header;
                Ok(Some(Frame::new(tag, body)))
            }
            _ => Ok(None),
        }
    }

    /// Bytes buffered but not yet part of a returned frame.
    pub fn len(&self) -> usize {
        self.unread.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unread.is_empty()
    }

    /// Drop buffered bytes and expect a header next.
    pub fn clear(&mut self) {
        self.unread.clear();
        self.expect = Expect::Header;
    }

    #[cfg(test)]
    fn mid_frame(&self) -> bool {
        matches!(self.expect, Expect::Body { .. })
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        FrameBuffer::new()
    }
}
