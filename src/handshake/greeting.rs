//! GREETING frame body.
//!
//! The body is a run of `(u8 type, u8 len, len bytes)` entries. Unknown
//! entry types are skipped so either side can add entries later.
//!
//! | Type | Entry | Value |
//! |------|-------|-------|
//! | 0 | VERSION | 1 byte |
//! | 1 | SASL_MECH | modified UTF-8, repeatable |
//! | 2 | ENDPOINT_NAME | modified UTF-8 |
//! | 3 | MARSHALLER_VERSION | `i32` BE, repeatable |

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::{MuxwireError, Result};
use crate::protocol::{greeting, mutf8, BodyReader};

/// Decoded GREETING.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Greeting {
    pub version: Option<u8>,
    pub mechanisms: Vec<String>,
    pub endpoint_name: Option<String>,
    pub marshaller_versions: Vec<i32>,
}

impl Greeting {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        if let Some(version) = self.version {
            put_entry(&mut buf, greeting::VERSION, &[version])?;
        }
        for mechanism in &self.mechanisms {
            put_entry(&mut buf, greeting::SASL_MECH, &mutf8::encode(mechanism))?;
        }
        if let Some(name) = &self.endpoint_name {
            put_entry(&mut buf, greeting::ENDPOINT_NAME, &mutf8::encode(name))?;
        }
        for version in &self.marshaller_versions {
            put_entry(&mut buf, greeting::MARSHALLER_VERSION, &version.to_be_bytes())?;
        }
        Ok(buf.freeze())
    }

    pub fn decode(body: Bytes) -> Result<Self> {
        let mut reader = BodyReader::new(body);
        let mut out = Self::default();
        while !reader.is_empty() {
            let kind = reader.read_u8()?;
            let len = reader.read_u8()? as usize;
            let value = reader.read_bytes(len)?;
            match kind {
                greeting::VERSION => {
                    let mut value = BodyReader::new(value);
                    out.version = Some(value.read_u8()?);
                }
                greeting::SASL_MECH => out.mechanisms.push(mutf8::decode(&value)?),
                greeting::ENDPOINT_NAME => out.endpoint_name = Some(mutf8::decode(&value)?),
                greeting::MARSHALLER_VERSION => {
                    out.marshaller_versions
                        .push(BodyReader::new(value).read_i32()?);
                }
                other => trace!(entry = other, len, "Skipping unknown greeting entry"),
            }
        }
        Ok(out)
    }
}

fn put_entry(buf: &mut BytesMut, kind: u8, value: &[u8]) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        MuxwireError::Protocol(format!(
            "Greeting entry {} is {} bytes, limit is 255",
            kind,
            value.len()
        ))
    })?;
    buf.put_u8(kind);
    buf.put_u8(len);
    buf.put_slice(value);
    Ok(())
}

/// Highest version present in both lists.
///
/// Walks the remote list in order; a later value replaces the current pick
/// only if it is strictly greater.
pub fn negotiate_version(local: &[i32], remote: &[i32]) -> Option<i32> {
    let mut best: Option<i32> = None;
    for version in remote {
        if local.contains(version) && best.map_or(true, |b| *version > b) {
            best = Some(*version);
        }
    }
    best
}
