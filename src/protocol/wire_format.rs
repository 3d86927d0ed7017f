//! Wire format encoding and decoding.
//!
//! Every frame starts with a 5-byte header:
//! ```text
//! ┌──────────────┬───────┬──────────────────────┐
//! │ Length       │ Tag   │ Body                 │
//! │ 4 bytes      │ 1 byte│ length - 1 bytes     │
//! │ uint32 BE    │       │ tag-specific layout  │
//! └──────────────┴───────┴──────────────────────┘
//! ```
//!
//! `Length` counts everything after the length field itself (tag + body).
//! All multi-byte integers are Big Endian.

use crate::error::{MuxwireError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Header size in bytes (length prefix + tag).
pub const HEADER_SIZE: usize = 5;

/// Default size of a pooled send buffer, header included.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default maximum accepted frame length (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Protocol version advertised in GREETING frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame tags.
pub mod tags {
    pub const GREETING: u8 = 0;
    pub const AUTH_REQUEST: u8 = 1;
    pub const AUTH_CHALLENGE: u8 = 2;
    pub const AUTH_RESPONSE: u8 = 3;
    pub const AUTH_COMPLETE: u8 = 4;
    pub const AUTH_REJECTED: u8 = 5;

    pub const SERVICE_REQUEST: u8 = 16;
    pub const SERVICE_NOT_FOUND: u8 = 17;
    pub const SERVICE_CLIENT_OPENED: u8 = 18;
    pub const CLIENT_CLOSED: u8 = 19;
    pub const REQUEST: u8 = 20;
    pub const REQUEST_ABORT: u8 = 21;
    pub const REQUEST_ACK_CHUNK: u8 = 22;
    pub const REPLY: u8 = 23;
    pub const REPLY_EXCEPTION: u8 = 24;
    pub const REPLY_ACK_CHUNK: u8 = 25;
    pub const REPLY_EXCEPTION_ABORT: u8 = 26;

    /// Human-readable tag name for logging.
    pub fn name(tag: u8) -> &'static str {
        match tag {
            GREETING => "GREETING",
            AUTH_REQUEST => "AUTH_REQUEST",
            AUTH_CHALLENGE => "AUTH_CHALLENGE",
            AUTH_RESPONSE => "AUTH_RESPONSE",
            AUTH_COMPLETE => "AUTH_COMPLETE",
            AUTH_REJECTED => "AUTH_REJECTED",
            SERVICE_REQUEST => "SERVICE_REQUEST",
            SERVICE_NOT_FOUND => "SERVICE_NOT_FOUND",
            SERVICE_CLIENT_OPENED => "SERVICE_CLIENT_OPENED",
            CLIENT_CLOSED => "CLIENT_CLOSED",
            REQUEST => "REQUEST",
            REQUEST_ABORT => "REQUEST_ABORT",
            REQUEST_ACK_CHUNK => "REQUEST_ACK_CHUNK",
            REPLY => "REPLY",
            REPLY_EXCEPTION => "REPLY_EXCEPTION",
            REPLY_ACK_CHUNK => "REPLY_ACK_CHUNK",
            REPLY_EXCEPTION_ABORT => "REPLY_EXCEPTION_ABORT",
            _ => "UNKNOWN",
        }
    }

    /// Check whether a tag belongs to the handshake/authentication phase.
    #[inline]
    pub fn is_handshake(tag: u8) -> bool {
        tag <= AUTH_REJECTED
    }
}

/// Chunk flags carried by REQUEST / REPLY / REPLY_EXCEPTION frames.
pub mod flags {
    /// First chunk of a message.
    pub const FIRST: u8 = 0b0000_0001;
    /// Last chunk of a message.
    pub const LAST: u8 = 0b0000_0010;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// GREETING entry types.
pub mod greeting {
    pub const VERSION: u8 = 0;
    pub const SASL_MECH: u8 = 1;
    pub const ENDPOINT_NAME: u8 = 2;
    pub const MARSHALLER_VERSION: u8 = 3;
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Bytes following the length field (tag + body).
    pub length: u32,
    /// Frame tag.
    pub tag: u8,
}

impl Header {
    /// Create a header for a body of `body_len` bytes.
    pub fn new(tag: u8, body_len: usize) -> Self {
        Self {
            length: body_len as u32 + 1,
            tag,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use muxwire::protocol::{tags, Header};
    ///
    /// let bytes = Header::new(tags::REQUEST_ABORT, 4).encode();
    /// assert_eq!(bytes, [0, 0, 0, 5, tags::REQUEST_ABORT]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (5 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4] = self.tag;
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            tag: buf[4],
        })
    }

    /// Body length in bytes.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.length.saturating_sub(1) as usize
    }

    /// Validate the declared frame length.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        validate_length(self.length, max_frame_size)
    }
}

/// Validate a raw length prefix.
///
/// A zero length has no room for the tag byte and is rejected.
pub fn validate_length(length: u32, max_frame_size: u32) -> Result<()> {
    if length == 0 {
        return Err(MuxwireError::Protocol(
            "Frame length 0 has no tag".to_string(),
        ));
    }
    if length > max_frame_size {
        return Err(MuxwireError::Protocol(format!(
            "Frame size {} exceeds maximum {}",
            length, max_frame_size
        )));
    }
    Ok(())
}
