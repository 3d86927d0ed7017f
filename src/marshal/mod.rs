//! Pluggable value marshalling.
//!
//! Application values are `serde_json::Value`s. How they become bytes is
//! decided per connection: each side advertises the marshaller versions its
//! [`MarshallerFactory`] supports, the highest common version wins, and every
//! request and reply on the connection is written with it.
//!
//! - [`StandardMarshalling`] - version 1 JSON, version 2 MessagePack
//!
//! # Client references
//!
//! A value may carry a handle to a client exported by the sending side, in
//! the externalized form `{"$client": id}`. Unmarshallers resolve these
//! through the [`UnmarshalContext`] passed to every `read_value` call.
//!
//! # Example
//!
//! ```
//! use muxwire::marshal::{MarshallerFactory, MarshallingConfig, StandardMarshalling, UnmarshalContext};
//! use serde_json::json;
//!
//! let factory = StandardMarshalling::new();
//! let config = MarshallingConfig::new(2);
//!
//! let mut bytes = Vec::new();
//! factory.create_marshaller(&config).unwrap()
//!     .write_value(&mut bytes, &json!({"n": 1})).unwrap();
//!
//! let value = factory.create_unmarshaller(&config).unwrap()
//!     .read_value(&mut bytes.as_slice(), &UnmarshalContext::detached()).unwrap();
//! assert_eq!(value, json!({"n": 1}));
//! ```

mod context;
mod standard;

pub use context::UnmarshalContext;
pub use standard::{StandardMarshalling, JSON_VERSION, MSGPACK_VERSION};

use std::io::{Read, Write};

use crate::error::Result;

/// Application value type.
pub type Value = serde_json::Value;

/// Key of the externalized client reference object.
pub const CLIENT_REF_KEY: &str = "$client";

/// Agreed marshalling parameters for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshallingConfig {
    pub version: i32,
}

impl MarshallingConfig {
    pub fn new(version: i32) -> Self {
        Self { version }
    }
}

/// Writes values to a byte sink.
pub trait Marshaller: Send {
    fn write_value(&mut self, out: &mut dyn Write, value: &Value) -> Result<()>;
}

/// Reads one value from a byte source.
pub trait Unmarshaller: Send {
    /// Read a complete value, resolving client references through `ctx`.
    fn read_value(&mut self, input: &mut dyn Read, ctx: &UnmarshalContext) -> Result<Value>;
}

/// Creates marshallers for a negotiated version.
pub trait MarshallerFactory: Send + Sync + 'static {
    /// Supported versions, advertised in the GREETING.
    fn versions(&self) -> Vec<i32>;

    fn create_marshaller(&self, config: &MarshallingConfig) -> Result<Box<dyn Marshaller>>;

    fn create_unmarshaller(&self, config: &MarshallingConfig) -> Result<Box<dyn Unmarshaller>>;
}

/// Externalized reference to client `id`.
pub fn client_ref(id: i32) -> Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(CLIENT_REF_KEY.to_string(), Value::from(id));
    Value::Object(map)
}

/// Client id carried by `value` if it is an externalized client reference.
pub fn client_ref_id(value: &Value) -> Option<i32> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(CLIENT_REF_KEY)?
        .as_i64()
        .and_then(|id| i32::try_from(id).ok())
}

/// Call `f` for every client reference inside `value`.
pub fn visit_client_refs<F>(value: &Value, f: &mut F) -> Result<()>
where
    F: FnMut(i32) -> Result<()>,
{
    if let Some(id) = client_ref_id(value) {
        return f(id);
    }
    match value {
        Value::Array(items) => items.iter().try_for_each(|item| visit_client_refs(item, f)),
        Value::Object(map) => map.values().try_for_each(|item| visit_client_refs(item, f)),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_ref_shape() {
        assert_eq!(client_ref(-7), json!({"$client": -7}));
        assert_eq!(client_ref_id(&json!({"$client": -7})), Some(-7));
    }

    #[test]
    fn test_not_a_client_ref() {
        assert_eq!(client_ref_id(&json!({"$client": 1, "other": 2})), None);
        assert_eq!(client_ref_id(&json!({"$client": "1"})), None);
        assert_eq!(client_ref_id(&json!({"$client": 1u64 << 40})), None);
        assert_eq!(client_ref_id(&json!(3)), None);
    }

    #[test]
    fn test_visit_nested_refs() {
        let value = json!({
            "a": client_ref(1),
            "list": [client_ref(2), {"deep": client_ref(3)}],
            "plain": 4
        });
        let mut seen = Vec::new();
        visit_client_refs(&value, &mut |id| {
            seen.push(id);
            Ok(())
        })
        .unwrap();
        seen.sort();
        assert_eq!(seen, [1, 2, 3]);
    }
}
