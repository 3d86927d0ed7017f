//! Connection setup: GREETING exchange, then authentication.
//!
//! ```text
//! client                                   server
//!   GREETING(version, marshallers, name) ──►
//!                                        ◄── GREETING(version, mechanisms, name, marshallers)
//!   AUTH_REQUEST(mechanism)              ──►
//!                                        ◄── AUTH_CHALLENGE(bytes)
//!   AUTH_RESPONSE(bytes)                 ──►
//!                                        ◄── AUTH_COMPLETE(bytes) | AUTH_REJECTED(reason)
//! ```
//!
//! Each side runs a [`FrameHandler`](crate::connection::FrameHandler) that
//! replaces itself with a [`ConnectionHandler`] when authentication
//! completes, and reports the outcome exactly once through a oneshot.

mod client;
mod greeting;
mod server;

pub(crate) use client::ClientHandshake;
pub use greeting::{negotiate_version, Greeting};
pub(crate) use server::ServerHandshake;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::auth::MechanismRegistry;
use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{MuxwireError, Result};
use crate::handler::{ConnectionHandler, ServiceResolver};
use crate::marshal::{MarshallerFactory, MarshallingConfig};
use crate::protocol::PROTOCOL_VERSION;

/// What both sides agreed on during setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub protocol_version: u8,
    pub marshalling: MarshallingConfig,
    /// Peer's ENDPOINT_NAME, if it sent one.
    pub peer_name: Option<String>,
    pub mechanism: String,
    /// Identity the server's mechanism established (server side only).
    pub authorized_id: Option<String>,
}

/// Everything a handshake needs to build the steady-state handler.
#[derive(Clone)]
pub(crate) struct HandshakeContext {
    pub config: Arc<ConnectionConfig>,
    pub marshalling: Arc<dyn MarshallerFactory>,
    pub resolver: Arc<dyn ServiceResolver>,
    pub mechanisms: MechanismRegistry,
}

impl HandshakeContext {
    /// This side's greeting entries, without mechanisms.
    fn greeting(&self) -> Greeting {
        Greeting {
            version: Some(PROTOCOL_VERSION),
            mechanisms: Vec::new(),
            endpoint_name: self.config.endpoint_name.clone(),
            marshaller_versions: self.marshalling.versions(),
        }
    }

    /// Check the peer's greeting against ours.
    fn negotiate(&self, peer: &Greeting) -> Result<PeerTerms> {
        let version = peer.version.ok_or_else(|| {
            MuxwireError::Negotiation("peer greeting carries no protocol version".to_string())
        })?;
        let local = self.marshalling.versions();
        let marshaller = negotiate_version(&local, &peer.marshaller_versions).ok_or_else(|| {
            MuxwireError::Negotiation(format!(
                "no common marshaller version (local {:?}, peer {:?})",
                local, peer.marshaller_versions
            ))
        })?;
        Ok(PeerTerms {
            protocol_version: version.min(PROTOCOL_VERSION),
            marshalling: MarshallingConfig::new(marshaller),
            peer_name: peer.endpoint_name.clone(),
        })
    }

    /// Build the steady-state handler and make it the frame handler.
    fn establish(
        &self,
        connection: &Arc<Connection>,
        negotiated: Negotiated,
    ) -> Result<Arc<ConnectionHandler>> {
        let handler = ConnectionHandler::new(
            connection.clone(),
            negotiated,
            self.marshalling.clone(),
            self.resolver.clone(),
        );
        connection.set_frame_handler(handler.clone());
        if connection.is_closed() {
            return Err(MuxwireError::ConnectionClosed);
        }
        Ok(handler)
    }
}

/// Terms settled by the greeting exchange.
#[derive(Debug, Clone)]
struct PeerTerms {
    protocol_version: u8,
    marshalling: MarshallingConfig,
    peer_name: Option<String>,
}

impl PeerTerms {
    fn into_negotiated(self, mechanism: String, authorized_id: Option<String>) -> Negotiated {
        Negotiated {
            protocol_version: self.protocol_version,
            marshalling: self.marshalling,
            peer_name: self.peer_name,
            mechanism,
            authorized_id,
        }
    }
}

/// Result of a handshake, delivered once.
pub(crate) type HandshakeResult = Result<Arc<ConnectionHandler>>;

/// One-shot slot for the handshake result.
struct Outcome {
    tx: Mutex<Option<oneshot::Sender<HandshakeResult>>>,
}

impl Outcome {
    fn new(tx: oneshot::Sender<HandshakeResult>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Report `result` unless something was reported already.
    fn report(&self, result: HandshakeResult) {
        if let Some(tx) = self.tx.lock().take() {
            // The caller may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::ServiceRegistry;
    use crate::marshal::StandardMarshalling;

    fn context(versions: &[i32]) -> HandshakeContext {
        HandshakeContext {
            config: Arc::new(ConnectionConfig::default()),
            marshalling: Arc::new(StandardMarshalling::with_versions(versions)),
            resolver: Arc::new(ServiceRegistry::new()),
            mechanisms: MechanismRegistry::new(),
        }
    }

    #[test]
    fn test_highest_common_marshaller() {
        let ctx = context(&[1, 2]);
        let peer = Greeting {
            version: Some(1),
            marshaller_versions: vec![2, 3],
            ..Default::default()
        };
        assert_eq!(ctx.negotiate(&peer).unwrap().marshalling.version, 2);
    }

    #[test]
    fn test_no_common_marshaller() {
        let ctx = context(&[1]);
        let peer = Greeting {
            version: Some(1),
            marshaller_versions: vec![3],
            ..Default::default()
        };
        assert!(matches!(
            ctx.negotiate(&peer),
            Err(MuxwireError::Negotiation(_))
        ));
    }

    #[test]
    fn test_missing_version() {
        let ctx = context(&[1]);
        let peer = Greeting {
            marshaller_versions: vec![1],
            ..Default::default()
        };
        assert!(ctx.negotiate(&peer).is_err());
    }

    #[test]
    fn test_protocol_version_is_minimum() {
        let ctx = context(&[1]);
        let peer = Greeting {
            version: Some(PROTOCOL_VERSION + 3),
            marshaller_versions: vec![1],
            ..Default::default()
        };
        assert_eq!(ctx.negotiate(&peer).unwrap().protocol_version, PROTOCOL_VERSION);
    }
}
