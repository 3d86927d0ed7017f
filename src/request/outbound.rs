//! Requests this side sent, awaiting their reply.
//!
//! ```text
//! Sending ──all chunks sent──► ReplyWait ──first reply chunk──► Receiving ──LAST──► Closed
//!    │                            │                                │
//!    └──────── cancel() ──────────┴─► CancelWait ─► Closed         └─ cancel(): fault reply
//! ```
//!
//! The outcome sender lives inside the request and is taken exactly once:
//! by the first reply chunk, by cancellation, by REPLY_EXCEPTION_ABORT or by
//! teardown. Whoever loses the race finds it gone and does nothing.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{MuxwireError, Result};
use crate::flow_control::PermitPool;
use crate::handler::ConnectionHandler;
use crate::marshal::Value;
use crate::stream::{ChunkReceiver, StreamFault, StreamRelay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutboundState {
    Sending,
    ReplyWait,
    CancelWait,
    Receiving,
    Closed,
}

/// Where the outcome of a request goes.
pub(crate) enum OutcomeSender {
    /// Unmarshalled reply value.
    Value(oneshot::Sender<Result<Value>>),
    /// Raw reply chunks.
    Raw(oneshot::Sender<Result<RawReply>>),
}

impl OutcomeSender {
    pub fn fail(self, error: MuxwireError) {
        // A dropped receiver means the caller stopped waiting.
        match self {
            OutcomeSender::Value(tx) => {
                let _ = tx.send(Err(error));
            }
            OutcomeSender::Raw(tx) => {
                let _ = tx.send(Err(error));
            }
        }
    }
}

/// What cancelling a request requires of the caller.
pub(crate) enum Cancel {
    /// No reply yet: deliver `Cancelled` through the sender, if still held.
    Pending(Option<OutcomeSender>),
    /// Reply in progress: fault its stream.
    Receiving(Arc<StreamRelay>),
}

struct Inner {
    state: OutboundState,
    outcome: Option<OutcomeSender>,
    reply: Option<Arc<StreamRelay>>,
}

pub(crate) struct OutboundRequest {
    id: i32,
    client_id: i32,
    permits: PermitPool,
    inner: Mutex<Inner>,
}

impl OutboundRequest {
    pub fn new(id: i32, client_id: i32, window: usize, outcome: OutcomeSender) -> Self {
        Self {
            id,
            client_id,
            permits: PermitPool::new(window),
            inner: Mutex::new(Inner {
                state: OutboundState::Sending,
                outcome: Some(outcome),
                reply: None,
            }),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn permits(&self) -> &PermitPool {
        &self.permits
    }

    pub fn state(&self) -> OutboundState {
        self.inner.lock().state
    }

    /// The LAST request chunk went out.
    pub fn mark_sent(&self) {
        let mut inner = self.inner.lock();
        if inner.state == OutboundState::Sending {
            inner.state = OutboundState::ReplyWait;
        }
    }

    /// First reply chunk: hand the outcome sender to `make`, which builds
    /// the reply stream.
    ///
    /// `None` if the request is no longer waiting for a reply. `make` runs
    /// under the request lock and must not call back into this request.
    pub fn begin_reply<F>(&self, make: F) -> Option<Arc<StreamRelay>>
    where
        F: FnOnce(OutcomeSender) -> Arc<StreamRelay>,
    {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            OutboundState::Sending | OutboundState::ReplyWait
        ) {
            return None;
        }
        let outcome = inner.outcome.take()?;
        let relay = make(outcome);
        inner.state = OutboundState::Receiving;
        inner.reply = Some(relay.clone());
        Some(relay)
    }

    /// Reply stream, once the first reply chunk has arrived.
    pub fn reply(&self) -> Option<Arc<StreamRelay>> {
        self.inner.lock().reply.clone()
    }

    /// LAST reply chunk arrived.
    pub fn finish(&self) {
        self.inner.lock().state = OutboundState::Closed;
        self.permits.close();
    }

    pub fn cancel(&self) -> Option<Cancel> {
        let mut inner = self.inner.lock();
        match inner.state {
            OutboundState::Sending | OutboundState::ReplyWait => {
                inner.state = OutboundState::CancelWait;
                self.permits.close();
                Some(Cancel::Pending(inner.outcome.take()))
            }
            OutboundState::Receiving => {
                inner.state = OutboundState::Closed;
                self.permits.close();
                inner.reply.clone().map(Cancel::Receiving)
            }
            OutboundState::CancelWait | OutboundState::Closed => None,
        }
    }

    /// Cancellation finished; the entry is gone from the table.
    pub fn mark_closed(&self) {
        self.inner.lock().state = OutboundState::Closed;
    }

    /// The peer gave up sending its exception reply.
    pub fn abort_exception(&self) {
        let (outcome, reply) = self.close_with();
        if let Some(reply) = reply {
            reply.push_exception(StreamFault::ExceptionAborted);
        } else if let Some(outcome) = outcome {
            outcome.fail(MuxwireError::ReplyExceptionAborted);
        }
    }

    /// The connection closed before the reply completed.
    pub fn teardown(&self) {
        let (outcome, reply) = self.close_with();
        if let Some(outcome) = outcome {
            outcome.fail(MuxwireError::IndeterminateOutcome);
        }
        if let Some(reply) = reply {
            reply.push_exception(StreamFault::ConnectionClosed);
        }
    }

    fn close_with(&self) -> (Option<OutcomeSender>, Option<Arc<StreamRelay>>) {
        let taken = {
            let mut inner = self.inner.lock();
            inner.state = OutboundState::Closed;
            (inner.outcome.take(), inner.reply.clone())
        };
        self.permits.close();
        taken
    }
}

impl std::fmt::Debug for OutboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundRequest")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle on a request in flight.
///
/// `T` is [`Value`] for [`RemoteClient::send`](crate::handler::RemoteClient::send)
/// and [`RawReply`] for [`RemoteClient::send_raw`](crate::handler::RemoteClient::send_raw).
pub struct PendingReply<T> {
    handler: Arc<ConnectionHandler>,
    id: i32,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> PendingReply<T> {
    pub(crate) fn new(
        handler: Arc<ConnectionHandler>,
        id: i32,
        rx: oneshot::Receiver<Result<T>>,
    ) -> Self {
        Self { handler, id, rx }
    }

    /// Request id on the wire.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Wait for the outcome: the reply, the remote exception, `Cancelled`,
    /// or `IndeterminateOutcome` if the connection died first.
    pub async fn outcome(self) -> Result<T> {
        self.rx
            .await
            .unwrap_or(Err(MuxwireError::IndeterminateOutcome))
    }

    /// Cancel the request. No effect once the reply has completed.
    pub fn cancel(&self) {
        self.handler.cancel_request(self.id);
    }
}

impl<T> std::fmt::Debug for PendingReply<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply").field("id", &self.id).finish()
    }
}

/// Reply delivered as raw chunks.
pub struct RawReply {
    handler: Arc<ConnectionHandler>,
    id: i32,
    exception: bool,
    chunks: ChunkReceiver,
}

impl RawReply {
    pub(crate) fn new(
        handler: Arc<ConnectionHandler>,
        id: i32,
        exception: bool,
        chunks: ChunkReceiver,
    ) -> Self {
        Self {
            handler,
            id,
            exception,
            chunks,
        }
    }

    /// Request id on the wire.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// True if the peer replied with REPLY_EXCEPTION.
    pub fn is_exception(&self) -> bool {
        self.exception
    }

    /// Next chunk; `Ok(None)` after the last one.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        self.chunks.recv().await
    }

    /// Collect the whole payload.
    pub async fn collect(self) -> Result<Bytes> {
        self.chunks.collect().await
    }

    /// Stop receiving: the peer is told to abort and [`recv`](Self::recv)
    /// fails with `Cancelled` once already delivered chunks are drained.
    /// No effect after the last chunk arrived.
    pub fn cancel(&self) {
        self.handler.cancel_request(self.id);
    }
}

impl std::fmt::Debug for RawReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawReply")
            .field("id", &self.id)
            .field("exception", &self.exception)
            .field("chunks", &self.chunks)
            .finish()
    }
}
