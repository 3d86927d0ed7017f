//! Protocol module - wire format, framing, and frame bodies.
//!
//! This module implements the binary protocol:
//! - 5-byte length + tag header
//! - Frame buffer for accumulating partial reads
//! - Typed bodies for steady-state frames
//! - Modified UTF-8 strings

mod frame;
mod frame_buffer;
mod message;
pub mod mutf8;
mod wire_format;

pub use frame::{build_frame, BodyReader, Frame};
pub use frame_buffer::FrameBuffer;
pub use message::{decode_id, decode_string, encode_id, encode_string, ChunkHeader, ServiceRequest};
pub use wire_format::{
    flags, greeting, tags, validate_length, Header, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE,
    HEADER_SIZE, LENGTH_PREFIX_SIZE, PROTOCOL_VERSION,
};
