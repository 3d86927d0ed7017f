//! Error types for muxwire.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for all muxwire operations.
#[derive(Debug, Error)]
pub enum MuxwireError {
    /// I/O error on the underlying byte channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Marshaller could not be created or failed outside serde.
    #[error("Marshalling error: {0}")]
    Marshalling(String),

    /// Protocol error (malformed frame, truncated body, bad state).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Frame tag that is not valid in the current connection phase.
    #[error("Unknown frame tag: {0:#04x}")]
    UnknownTag(u8),

    /// Version or mechanism negotiation failed.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Local authentication mechanism failed.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Peer rejected our authentication.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Peer has no service registered for the requested type/group.
    #[error("Service not found: {service_type} (group {group_name})")]
    ServiceNotFound {
        service_type: String,
        group_name: String,
    },

    /// Remote request handler replied with an exception.
    #[error("Remote exception: {0}")]
    Remote(RemoteException),

    /// Peer aborted while transmitting an exception reply.
    #[error("Reply exception aborted")]
    ReplyExceptionAborted,

    /// Connection died before the request outcome was known.
    #[error("Request outcome is indeterminate: connection closed")]
    IndeterminateOutcome,

    /// Request was cancelled.
    #[error("Request cancelled")]
    Cancelled,

    /// Chunked stream was interrupted.
    #[error("Stream interrupted: {0}")]
    Interrupted(String),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias using MuxwireError.
pub type Result<T> = std::result::Result<T, MuxwireError>;

/// Exception value carried by REPLY_EXCEPTION frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    /// Short classification, e.g. `NoReply` or an application error name.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteException {
    /// Create a new exception value.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Wrap a local error.
    pub fn from_error(kind: impl Into<String>, error: &MuxwireError) -> Self {
        Self::new(kind, error.to_string())
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteException {}
