//! Built-in JSON and MessagePack marshalling.
//!
//! MessagePack values are written with `write_named` so objects keep their
//! keys as map entries.

use std::io::{Read, Write};

use super::{
    visit_client_refs, Marshaller, MarshallerFactory, MarshallingConfig, UnmarshalContext,
    Unmarshaller, Value,
};
use crate::error::{MuxwireError, Result};

/// JSON via `serde_json`.
pub const JSON_VERSION: i32 = 1;

/// MessagePack via `rmp-serde`.
pub const MSGPACK_VERSION: i32 = 2;

/// Marshaller factory supporting JSON and MessagePack.
#[derive(Debug, Clone)]
pub struct StandardMarshalling {
    versions: Vec<i32>,
}

impl StandardMarshalling {
    /// Support both versions.
    pub fn new() -> Self {
        Self {
            versions: vec![JSON_VERSION, MSGPACK_VERSION],
        }
    }

    /// Restrict to a subset of versions.
    ///
    /// Unknown versions are dropped.
    pub fn with_versions(versions: &[i32]) -> Self {
        Self {
            versions: versions
                .iter()
                .copied()
                .filter(|v| *v == JSON_VERSION || *v == MSGPACK_VERSION)
                .collect(),
        }
    }

    fn check(&self, config: &MarshallingConfig) -> Result<()> {
        if self.versions.contains(&config.version) {
            Ok(())
        } else {
            Err(MuxwireError::Marshalling(format!(
                "Unsupported marshaller version {}",
                config.version
            )))
        }
    }
}

impl Default for StandardMarshalling {
    fn default() -> Self {
        Self::new()
    }
}

impl MarshallerFactory for StandardMarshalling {
    fn versions(&self) -> Vec<i32> {
        self.versions.clone()
    }

    fn create_marshaller(&self, config: &MarshallingConfig) -> Result<Box<dyn Marshaller>> {
        self.check(config)?;
        Ok(match config.version {
            JSON_VERSION => Box::new(JsonMarshaller),
            _ => Box::new(MsgPackMarshaller),
        })
    }

    fn create_unmarshaller(&self, config: &MarshallingConfig) -> Result<Box<dyn Unmarshaller>> {
        self.check(config)?;
        Ok(match config.version {
            JSON_VERSION => Box::new(JsonMarshaller),
            _ => Box::new(MsgPackMarshaller),
        })
    }
}

struct JsonMarshaller;

impl Marshaller for JsonMarshaller {
    fn write_value(&mut self, out: &mut dyn Write, value: &Value) -> Result<()> {
        serde_json::to_writer(out, value)?;
        Ok(())
    }
}

impl Unmarshaller for JsonMarshaller {
    fn read_value(&mut self, input: &mut dyn Read, ctx: &UnmarshalContext) -> Result<Value> {
        let value: Value = serde_json::from_reader(input)?;
        resolve_refs(&value, ctx)?;
        Ok(value)
    }
}

struct MsgPackMarshaller;

impl Marshaller for MsgPackMarshaller {
    fn write_value(&mut self, mut out: &mut dyn Write, value: &Value) -> Result<()> {
        rmp_serde::encode::write_named(&mut out, value)?;
        Ok(())
    }
}

impl Unmarshaller for MsgPackMarshaller {
    fn read_value(&mut self, input: &mut dyn Read, ctx: &UnmarshalContext) -> Result<Value> {
        let value: Value = rmp_serde::from_read(input)?;
        resolve_refs(&value, ctx)?;
        Ok(value)
    }
}

fn resolve_refs(value: &Value, ctx: &UnmarshalContext) -> Result<()> {
    visit_client_refs(value, &mut |id| ctx.resolve_client(id).map(drop))
}
