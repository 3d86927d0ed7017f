//! Connecting side of the handshake.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Greeting, HandshakeContext, HandshakeResult, Outcome, PeerTerms};
use crate::auth::ClientMechanism;
use crate::connection::{CloseReason, Connection, FrameHandler};
use crate::error::{MuxwireError, Result};
use crate::handler::BoxFuture;
use crate::protocol::{decode_string, encode_string, tags, Frame};
use crate::writer::OutboundFrame;

enum Phase {
    AwaitingGreeting,
    Authenticating {
        terms: PeerTerms,
        name: String,
        mechanism: Box<dyn ClientMechanism>,
    },
    Done,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitingGreeting => "awaiting greeting",
            Phase::Authenticating { .. } => "authenticating",
            Phase::Done => "done",
        }
    }
}

/// Client handshake, installed as the frame handler until AUTH_COMPLETE.
pub(crate) struct ClientHandshake {
    ctx: HandshakeContext,
    phase: Mutex<Phase>,
    outcome: Outcome,
}

impl ClientHandshake {
    pub fn new(ctx: HandshakeContext, tx: oneshot::Sender<HandshakeResult>) -> Self {
        Self {
            ctx,
            phase: Mutex::new(Phase::AwaitingGreeting),
            outcome: Outcome::new(tx),
        }
    }

    /// Open the exchange. The client always speaks first.
    pub async fn send_greeting(&self, connection: &Connection) -> Result<()> {
        let greeting = self.ctx.greeting().encode()?;
        connection
            .send(OutboundFrame::new(tags::GREETING, greeting))
            .await
    }

    /// Give up before the exchange started.
    pub fn abort(&self, error: MuxwireError) {
        self.outcome.report(Err(error));
    }

    async fn step(&self, connection: &Arc<Connection>, frame: Frame) -> Result<()> {
        if frame.tag == tags::AUTH_REJECTED {
            let reason = decode_string(frame.body)?;
            return Err(MuxwireError::AuthRejected(reason));
        }

        let phase = std::mem::replace(&mut *self.phase.lock(), Phase::Done);
        match (phase, frame.tag) {
            (Phase::AwaitingGreeting, tags::GREETING) => {
                let greeting = Greeting::decode(frame.body)?;
                let terms = self.ctx.negotiate(&greeting)?;
                if greeting.mechanisms.is_empty() {
                    return Err(MuxwireError::Negotiation(
                        "server offered no authentication mechanisms".to_string(),
                    ));
                }
                let (name, mechanism) = self
                    .ctx
                    .mechanisms
                    .select_client(&greeting.mechanisms, &self.ctx.config.mechanisms)
                    .ok_or_else(|| {
                        MuxwireError::Negotiation(format!(
                            "no supported mechanism among {:?}",
                            greeting.mechanisms
                        ))
                    })?;
                debug!(
                    mechanism = %name,
                    marshaller = terms.marshalling.version,
                    peer = ?terms.peer_name,
                    "Server greeting accepted"
                );
                let request = encode_string(&name);
                *self.phase.lock() = Phase::Authenticating {
                    terms,
                    name,
                    mechanism,
                };
                connection
                    .send(OutboundFrame::new(tags::AUTH_REQUEST, request))
                    .await
            }
            (
                Phase::Authenticating {
                    terms,
                    name,
                    mut mechanism,
                },
                tags::AUTH_CHALLENGE,
            ) => {
                let response = mechanism.evaluate_challenge(&frame.body)?;
                *self.phase.lock() = Phase::Authenticating {
                    terms,
                    name,
                    mechanism,
                };
                connection
                    .send(OutboundFrame::new(tags::AUTH_RESPONSE, Bytes::from(response)))
                    .await
            }
            (
                Phase::Authenticating {
                    terms,
                    name,
                    mut mechanism,
                },
                tags::AUTH_COMPLETE,
            ) => {
                if !mechanism.is_complete() {
                    mechanism.evaluate_challenge(&frame.body)?;
                }
                if !mechanism.is_complete() {
                    return Err(MuxwireError::Authentication(format!(
                        "server completed before {} did",
                        name
                    )));
                }
                debug!(mechanism = %name, "Authenticated");
                let handler = self
                    .ctx
                    .establish(connection, terms.into_negotiated(name, None))?;
                self.outcome.report(Ok(handler));
                Ok(())
            }
            (phase, tag) => Err(MuxwireError::Protocol(format!(
                "unexpected {} while {}",
                tags::name(tag),
                phase.name()
            ))),
        }
    }
}

impl FrameHandler for ClientHandshake {
    fn handle_frame<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Err(e) = self.step(connection, frame).await {
                warn!(error = %e, "Client handshake failed");
                self.outcome.report(Err(e));
                connection.close();
            }
            Ok(())
        })
    }

    fn handle_close(&self, _connection: &Arc<Connection>, reason: &CloseReason) {
        self.outcome.report(Err(reason.to_error()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Anonymous, MechanismRegistry};
    use crate::config::{ConnectionConfig, Side};
    use crate::handler::ServiceRegistry;
    use crate::marshal::StandardMarshalling;
    use crate::protocol::build_frame;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn context() -> HandshakeContext {
        let mut mechanisms = MechanismRegistry::new();
        mechanisms.register(Arc::new(Anonymous::new()));
        HandshakeContext {
            config: Arc::new(ConnectionConfig::default()),
            marshalling: Arc::new(StandardMarshalling::new()),
            resolver: Arc::new(ServiceRegistry::new()),
            mechanisms,
        }
    }

    async fn read_frame(stream: &mut DuplexStream) -> Frame {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut body = vec![0u8; len - 1];
        stream.read_exact(&mut body).await.unwrap();
        Frame::new(header[4], Bytes::from(body))
    }

    async fn start() -> (
        DuplexStream,
        oneshot::Receiver<HandshakeResult>,
        Arc<Connection>,
    ) {
        let (local, remote) = duplex(64 * 1024);
        let (tx, rx) = oneshot::channel();
        let ctx = context();
        let config = ctx.config.clone();
        let handshake = Arc::new(ClientHandshake::new(ctx, tx));
        let connection = Connection::start(local, Side::Client, config, handshake.clone());
        handshake.send_greeting(&connection).await.unwrap();
        (remote, rx, connection)
    }

    #[tokio::test]
    async fn test_greeting_then_auth_request() {
        let (mut remote, _rx, _connection) = start().await;

        let greeting = read_frame(&mut remote).await;
        assert_eq!(greeting.tag, tags::GREETING);
        let greeting = Greeting::decode(greeting.body).unwrap();
        assert_eq!(greeting.marshaller_versions, [1, 2]);
        assert!(greeting.mechanisms.is_empty());

        let offer = Greeting {
            version: Some(1),
            mechanisms: vec!["ANONYMOUS".to_string()],
            marshaller_versions: vec![1],
            ..Default::default()
        };
        remote
            .write_all(&build_frame(tags::GREETING, &offer.encode().unwrap()))
            .await
            .unwrap();

        let request = read_frame(&mut remote).await;
        assert_eq!(request.tag, tags::AUTH_REQUEST);
        assert_eq!(decode_string(request.body).unwrap(), "ANONYMOUS");
    }

    #[tokio::test]
    async fn test_no_offered_mechanisms_fails() {
        let (mut remote, rx, connection) = start().await;
        read_frame(&mut remote).await;

        let offer = Greeting {
            version: Some(1),
            marshaller_versions: vec![1],
            ..Default::default()
        };
        remote
            .write_all(&build_frame(tags::GREETING, &offer.encode().unwrap()))
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MuxwireError::Negotiation(_))));
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejection_reported() {
        let (mut remote, rx, _connection) = start().await;
        read_frame(&mut remote).await;

        remote
            .write_all(&build_frame(tags::AUTH_REJECTED, b"go away"))
            .await
            .unwrap();

        match rx.await.unwrap() {
            Err(MuxwireError::AuthRejected(reason)) => assert_eq!(reason, "go away"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_eof_before_greeting() {
        let (remote, rx, _connection) = start().await;
        drop(remote);
        assert!(matches!(
            rx.await.unwrap(),
            Err(MuxwireError::ConnectionClosed)
        ));
    }
}
