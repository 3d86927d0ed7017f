//! Accepting side of the handshake.
//!
//! The server answers the client's GREETING with its own, offering the
//! mechanisms it can verify, and then drives the chosen mechanism. Any
//! failure after the greeting went out is flushed to the client before the
//! connection closes, so the client can report the precise cause.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{Greeting, HandshakeContext, HandshakeResult, Outcome, PeerTerms};
use crate::auth::ServerMechanism;
use crate::connection::{CloseReason, Connection, FrameHandler};
use crate::error::{MuxwireError, Result};
use crate::handler::BoxFuture;
use crate::protocol::{decode_string, encode_string, tags, Frame};
use crate::writer::OutboundFrame;

enum Phase {
    AwaitingGreeting,
    AwaitingAuthRequest {
        terms: PeerTerms,
        offered: Vec<String>,
    },
    Authenticating {
        terms: PeerTerms,
        name: String,
        mechanism: Box<dyn ServerMechanism>,
    },
    Done,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Phase::AwaitingGreeting => "awaiting greeting",
            Phase::AwaitingAuthRequest { .. } => "awaiting auth request",
            Phase::Authenticating { .. } => "authenticating",
            Phase::Done => "done",
        }
    }
}

/// Server handshake, installed as the frame handler until authentication
/// completes or is rejected.
pub(crate) struct ServerHandshake {
    ctx: HandshakeContext,
    phase: Mutex<Phase>,
    outcome: Outcome,
}

impl ServerHandshake {
    pub fn new(ctx: HandshakeContext, tx: oneshot::Sender<HandshakeResult>) -> Self {
        Self {
            ctx,
            phase: Mutex::new(Phase::AwaitingGreeting),
            outcome: Outcome::new(tx),
        }
    }

    async fn step(&self, connection: &Arc<Connection>, frame: Frame) -> Result<()> {
        let phase = std::mem::replace(&mut *self.phase.lock(), Phase::Done);
        match (phase, frame.tag) {
            (Phase::AwaitingGreeting, tags::GREETING) => {
                let peer = Greeting::decode(frame.body)?;
                let offered = self.ctx.mechanisms.server_offer(&self.ctx.config.mechanisms);
                let mut greeting = self.ctx.greeting();
                greeting.mechanisms = offered.clone();
                connection
                    .send(OutboundFrame::new(tags::GREETING, greeting.encode()?))
                    .await?;

                let terms = self.ctx.negotiate(&peer)?;
                if offered.is_empty() {
                    return Err(MuxwireError::Negotiation(
                        "no authentication mechanisms to offer".to_string(),
                    ));
                }
                debug!(
                    marshaller = terms.marshalling.version,
                    peer = ?terms.peer_name,
                    offered = ?offered,
                    "Client greeting accepted"
                );
                *self.phase.lock() = Phase::AwaitingAuthRequest { terms, offered };
                Ok(())
            }
            (Phase::AwaitingAuthRequest { terms, offered }, tags::AUTH_REQUEST) => {
                let name = decode_string(frame.body)?;
                let mechanism = offered
                    .contains(&name)
                    .then(|| self.ctx.mechanisms.get(&name))
                    .flatten()
                    .and_then(|provider| provider.server_mechanism());
                let Some(mut mechanism) = mechanism else {
                    return self
                        .reject(connection, format!("unsupported mechanism {}", name))
                        .await;
                };
                debug!(mechanism = %name, "Authentication requested");
                match mechanism.initial_challenge() {
                    Ok(challenge) => {
                        self.advance(connection, terms, name, mechanism, challenge)
                            .await
                    }
                    Err(e) => self.reject(connection, e.to_string()).await,
                }
            }
            (
                Phase::Authenticating {
                    terms,
                    name,
                    mut mechanism,
                },
                tags::AUTH_RESPONSE,
            ) => match mechanism.evaluate_response(&frame.body) {
                Ok(challenge) => {
                    self.advance(connection, terms, name, mechanism, challenge)
                        .await
                }
                Err(e) => self.reject(connection, e.to_string()).await,
            },
            (phase, tag) => Err(MuxwireError::Protocol(format!(
                "unexpected {} while {}",
                tags::name(tag),
                phase.name()
            ))),
        }
    }

    /// Send the next challenge, or finish if the mechanism is done.
    async fn advance(
        &self,
        connection: &Arc<Connection>,
        terms: PeerTerms,
        name: String,
        mechanism: Box<dyn ServerMechanism>,
        data: Vec<u8>,
    ) -> Result<()> {
        if !mechanism.is_complete() {
            *self.phase.lock() = Phase::Authenticating {
                terms,
                name,
                mechanism,
            };
            return connection
                .send(OutboundFrame::new(tags::AUTH_CHALLENGE, Bytes::from(data)))
                .await;
        }

        let authorized_id = mechanism.authorized_id();
        debug!(mechanism = %name, authorized_id = ?authorized_id, "Authenticated");
        let handler = self
            .ctx
            .establish(connection, terms.into_negotiated(name, authorized_id))?;
        connection
            .send(OutboundFrame::new(tags::AUTH_COMPLETE, Bytes::from(data)))
            .await?;
        self.outcome.report(Ok(handler));
        Ok(())
    }

    async fn reject(&self, connection: &Arc<Connection>, reason: String) -> Result<()> {
        warn!(reason = %reason, "Rejecting authentication");
        connection
            .send(OutboundFrame::new(tags::AUTH_REJECTED, encode_string(&reason)))
            .await?;
        Err(MuxwireError::Authentication(reason))
    }
}

impl FrameHandler for ServerHandshake {
    fn handle_frame<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Err(e) = self.step(connection, frame).await {
                debug!(error = %e, "Server handshake failed");
                self.outcome.report(Err(e));
                connection.flush_and_close().await;
            }
            Ok(())
        })
    }

    fn handle_close(&self, _connection: &Arc<Connection>, reason: &CloseReason) {
        self.outcome.report(Err(reason.to_error()));
    }
}
