//! Typed frame bodies for the steady-state protocol.
//!
//! ```text
//! SERVICE_REQUEST           i32 id | mutf8 type NUL | mutf8 group NUL
//! REQUEST / REPLY / REPLY_EXCEPTION
//!                           i32 id | u8 flags | [i32 client id] | data
//! everything else           i32 id
//! ```
//!
//! The client id is only present on the FIRST chunk of a REQUEST.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::BodyReader;
use super::mutf8;
use super::wire_format::{flags, tags};
use crate::error::Result;

/// Body of a SERVICE_REQUEST frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub id: i32,
    pub service_type: String,
    pub group_name: String,
}

impl ServiceRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            4 + self.service_type.len() + self.group_name.len() + 2,
        );
        buf.put_i32(self.id);
        let mut text = Vec::new();
        mutf8::encode_into(&self.service_type, &mut text);
        text.push(0);
        mutf8::encode_into(&self.group_name, &mut text);
        text.push(0);
        buf.put_slice(&text);
        buf.freeze()
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        Ok(Self {
            id: reader.read_i32()?,
            service_type: reader.read_cstring()?,
            group_name: reader.read_cstring()?,
        })
    }
}

/// Encode a body consisting of a single id.
pub fn encode_id(id: i32) -> Bytes {
    Bytes::copy_from_slice(&id.to_be_bytes())
}

/// Decode a body consisting of a single id.
pub fn decode_id(body: Bytes) -> Result<i32> {
    BodyReader::new(body).read_i32()
}

/// Encode a body carrying a modified UTF-8 string without terminator.
pub fn encode_string(s: &str) -> Bytes {
    Bytes::from(mutf8::encode(s))
}

/// Decode a body carrying a modified UTF-8 string without terminator.
pub fn decode_string(body: Bytes) -> Result<String> {
    BodyReader::new(body).read_string_to_end()
}

/// Leading fields of a REQUEST, REPLY or REPLY_EXCEPTION chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: i32,
    pub flags: u8,
    pub client_id: Option<i32>,
}

impl ChunkHeader {
    pub fn new(id: i32, flags: u8) -> Self {
        Self {
            id,
            flags,
            client_id: None,
        }
    }

    /// First chunk of a request, carrying the target client id.
    pub fn first_request(id: i32, client_id: i32) -> Self {
        Self {
            id,
            flags: flags::FIRST,
            client_id: Some(client_id),
        }
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        flags::has_flag(self.flags, flags::FIRST)
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        flags::has_flag(self.flags, flags::LAST)
    }

    /// Encoded size of this header.
    pub fn encoded_len(&self) -> usize {
        5 + if self.client_id.is_some() { 4 } else { 0 }
    }

    /// Write the header at the start of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.id.to_be_bytes());
        buf[4] = self.flags;
        if let Some(client_id) = self.client_id {
            buf[5..9].copy_from_slice(&client_id.to_be_bytes());
        }
    }

    /// Parse the header from a chunk body, returning the data that follows.
    pub fn decode(tag: u8, body: Bytes) -> Result<(Self, Bytes)> {
        let mut reader = BodyReader::new(body);
        let id = reader.read_i32()?;
        let flags = reader.read_u8()?;
        let client_id = if tag == tags::REQUEST && flags::has_flag(flags, flags::FIRST) {
            Some(reader.read_i32()?)
        } else {
            None
        };
        Ok((
            Self {
                id,
                flags,
                client_id,
            },
            reader.remaining(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxwireError;

    #[test]
    fn test_service_request_layout() {
        let request = ServiceRequest {
            id: 0x0102_0304,
            service_type: "echo".to_string(),
            group_name: "default".to_string(),
        };
        let body = request.encode();

        assert_eq!(&body[..4], &[1, 2, 3, 4]);
        assert_eq!(&body[4..], b"echo\0default\0");
        assert_eq!(ServiceRequest::decode(body).unwrap(), request);
    }

    #[test]
    fn test_service_request_missing_group() {
        let mut body = 1i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"echo\0");
        let err = ServiceRequest::decode(Bytes::from(body)).unwrap_err();
        assert!(matches!(err, MuxwireError::Protocol(_)));
    }

    #[test]
    fn test_id_body() {
        assert_eq!(decode_id(encode_id(-42)).unwrap(), -42);
        assert!(decode_id(Bytes::from_static(&[1, 2])).is_err());
    }

    #[test]
    fn test_first_request_chunk_carries_client_id() {
        let header = ChunkHeader::first_request(10, 20);
        let mut body = vec![0u8; header.encoded_len()];
        header.encode_into(&mut body);
        body.extend_from_slice(b"data");

        let (decoded, data) = ChunkHeader::decode(tags::REQUEST, Bytes::from(body)).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.is_first());
        assert!(!decoded.is_last());
        assert_eq!(&data[..], b"data");
    }

    #[test]
    fn test_reply_chunk_has_no_client_id() {
        // A FIRST reply chunk must not consume four bytes of data as a client id.
        let header = ChunkHeader::new(10, flags::FIRST | flags::LAST);
        let mut body = vec![0u8; header.encoded_len()];
        header.encode_into(&mut body);
        body.extend_from_slice(b"abcd");

        let (decoded, data) = ChunkHeader::decode(tags::REPLY, Bytes::from(body)).unwrap();
        assert_eq!(decoded.client_id, None);
        assert!(decoded.is_last());
        assert_eq!(&data[..], b"abcd");
    }

    #[test]
    fn test_continuation_request_chunk() {
        let header = ChunkHeader::new(3, flags::LAST);
        let mut body = vec![0u8; header.encoded_len()];
        header.encode_into(&mut body);

        let (decoded, data) = ChunkHeader::decode(tags::REQUEST, Bytes::from(body)).unwrap();
        assert_eq!(decoded.client_id, None);
        assert!(data.is_empty());
    }

    #[test]
    fn test_string_body() {
        let body = encode_string("reason\0x");
        assert_eq!(decode_string(body).unwrap(), "reason\0x");
    }
}
