//! Connection-scoped configuration.
//!
//! Every field has a default, so a partial JSON document is enough:
//!
//! ```
//! use muxwire::ConnectionConfig;
//!
//! let config = ConnectionConfig::from_json(r#"{ "window_size": 8 }"#).unwrap();
//! assert_eq!(config.window_size, 8);
//! assert_eq!(config.buffer_size, 4096);
//! ```

use serde::{Deserialize, Serialize};

use crate::buffer_pool::DEFAULT_POOL_CAPACITY;
use crate::error::{MuxwireError, Result};
use crate::flow_control::DEFAULT_WINDOW;
use crate::protocol::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};

/// Default writer channel capacity.
pub const DEFAULT_WRITE_CHANNEL_CAPACITY: usize = 1024;

/// Default read buffer size (64KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default maximum concurrently executing inbound requests.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 256;

/// Which end of the byte channel this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Connecting side; sends the first GREETING.
    Client,
    /// Accepting side; offers mechanisms and verifies credentials.
    Server,
}

/// Options shared by everything running on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Name sent in the ENDPOINT_NAME greeting entry, if any.
    pub endpoint_name: Option<String>,
    /// Size of each pooled send buffer, frame header included.
    pub buffer_size: usize,
    /// Number of pooled send buffers.
    pub buffer_pool_capacity: usize,
    /// Largest accepted inbound frame length.
    ///
    /// Local only: neither limit is exchanged in the GREETING. A frame
    /// above it is a protocol error that closes the connection, so both
    /// ends must be configured with the peer's `buffer_size` at most
    /// `max_frame_size + 4`.
    pub max_frame_size: u32,
    /// Unacknowledged chunks allowed per request.
    pub window_size: usize,
    /// Writer task channel capacity.
    pub write_channel_capacity: usize,
    /// Size of the read loop's scratch buffer.
    pub read_buffer_size: usize,
    /// Maximum inbound requests executing at once.
    pub max_concurrent_requests: usize,
    /// Mechanism names. On the client this is a preference order; on the
    /// server it restricts what is offered. Empty means everything registered.
    pub mechanisms: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint_name: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_pool_capacity: DEFAULT_POOL_CAPACITY,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            window_size: DEFAULT_WINDOW,
            write_channel_capacity: DEFAULT_WRITE_CHANNEL_CAPACITY,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            mechanisms: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    ///
    /// Only this side's values are checked. Whether the peer's chunks fit
    /// our `max_frame_size` depends on its `buffer_size`, which is never
    /// sent; see [`max_frame_size`](Self::max_frame_size).
    pub fn validate(&self) -> Result<()> {
        // Room for the header and the longest chunk header plus one data byte.
        let min_buffer = HEADER_SIZE + 10;
        if self.buffer_size < min_buffer {
            return Err(invalid(format!(
                "buffer_size {} is below the minimum {}",
                self.buffer_size, min_buffer
            )));
        }
        if self.buffer_size as u64 > self.max_frame_size as u64 + 4 {
            return Err(invalid(format!(
                "buffer_size {} exceeds max_frame_size {}",
                self.buffer_size, self.max_frame_size
            )));
        }
        if self.window_size == 0 {
            return Err(invalid("window_size must be at least 1".to_string()));
        }
        if self.write_channel_capacity == 0 {
            return Err(invalid("write_channel_capacity must be at least 1".to_string()));
        }
        if self.read_buffer_size == 0 {
            return Err(invalid("read_buffer_size must be at least 1".to_string()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(invalid("max_concurrent_requests must be at least 1".to_string()));
        }
        if let Some(name) = &self.endpoint_name {
            if crate::protocol::mutf8::encode(name).len() > u8::MAX as usize {
                return Err(invalid("endpoint_name is longer than 255 bytes".to_string()));
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> MuxwireError {
    MuxwireError::Protocol(format!("Invalid configuration: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.buffer_pool_capacity, 64);
        assert_eq!(config.window_size, 5);
        assert_eq!(config.max_concurrent_requests, 256);
        assert!(config.mechanisms.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json() {
        let config = ConnectionConfig::from_json(
            r#"{ "endpoint_name": "node-a", "mechanisms": ["PLAIN", "ANONYMOUS"] }"#,
        )
        .unwrap();
        assert_eq!(config.endpoint_name.as_deref(), Some("node-a"));
        assert_eq!(config.mechanisms, ["PLAIN", "ANONYMOUS"]);
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = ConnectionConfig::from_json(r#"{ "window_size": 0 }"#).unwrap_err();
        assert!(err.to_string().contains("window_size"));
    }

    #[test]
    fn test_tiny_buffer_rejected() {
        let config = ConnectionConfig {
            buffer_size: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_larger_than_frame_rejected() {
        let config = ConnectionConfig {
            buffer_size: 8192,
            max_frame_size: 1024,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            ConnectionConfig::from_json("{ not json"),
            Err(MuxwireError::Json(_))
        ));
    }
}
