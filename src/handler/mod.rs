//! Steady-state frame handling.
//!
//! Once authentication completes, a [`ConnectionHandler`] becomes the
//! connection's frame handler. It demultiplexes every frame by id into four
//! correlation tables:
//!
//! | Table | Key | Entry |
//! |-------|-----|-------|
//! | outbound clients | id we chose | SERVICE_REQUEST awaiting an answer |
//! | inbound clients | id either side chose | local handler exposed to the peer |
//! | outbound requests | id we chose | request awaiting its reply |
//! | inbound requests | id the peer chose | request executing locally |
//!
//! Frames naming an id that is not in its table are logged and dropped.
//! Unknown tags and handshake tags close the connection.
//!
//! Request handlers and unmarshalling never run on the read loop: execution
//! is spawned on the runtime, unmarshalling on its blocking pool.

mod client;
mod context;
mod ids;
mod registry;

pub use client::{ExportedClient, RemoteClient};
pub use context::ReplyContext;
pub use ids::{IdNamespace, IdTable};
pub use registry::{
    BoxFuture, HandlerFactory, RequestHandler, ServiceRegistry, ServiceResolver, TypedHandler,
    ANY_GROUP,
};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, trace, warn};

use crate::config::Side;
use crate::connection::{CloseReason, Connection, FrameHandler};
use crate::error::{MuxwireError, RemoteException, Result};
use crate::handshake::Negotiated;
use crate::marshal::{MarshallerFactory, UnmarshalContext, Unmarshaller, Value};
use crate::protocol::{decode_id, encode_id, tags, ChunkHeader, Frame, ServiceRequest};
use crate::request::{
    exception_from_value, read_payload, send_reply, single_chunk, Cancel, ChunkedWriter,
    InboundRequest, OutboundRequest, OutcomeSender, RawReply, ReplyBody,
};
use crate::stream::{bridge, AckFn, BridgeReader, ChunkReceiver, StreamFault, StreamRelay, StreamSink};
use crate::writer::OutboundFrame;
use client::{InboundClientHandle, OutboundClientHandle};

/// Exception kind sent for a request addressed to an unknown client.
pub const CLIENT_CLOSED: &str = "ClientClosed";

/// Exception kind sent when a request could not be unmarshalled.
pub const UNMARSHALLING_ERROR: &str = "UnmarshallingError";

/// Number of entries in each correlation table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableSizes {
    pub outbound_clients: usize,
    pub inbound_clients: usize,
    pub outbound_requests: usize,
    pub inbound_requests: usize,
}

/// Steady-state handler of one authenticated connection.
pub struct ConnectionHandler {
    self_ref: Weak<ConnectionHandler>,
    connection: Arc<Connection>,
    namespace: IdNamespace,
    negotiated: Negotiated,
    marshalling: Arc<dyn MarshallerFactory>,
    resolver: Arc<dyn ServiceResolver>,
    outbound_clients: IdTable<Arc<OutboundClientHandle>>,
    inbound_clients: IdTable<Arc<InboundClientHandle>>,
    outbound_requests: IdTable<Arc<OutboundRequest>>,
    inbound_requests: IdTable<Arc<InboundRequest>>,
    request_limit: Arc<Semaphore>,
}

impl ConnectionHandler {
    pub(crate) fn new(
        connection: Arc<Connection>,
        negotiated: Negotiated,
        marshalling: Arc<dyn MarshallerFactory>,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Arc<Self> {
        let namespace = IdNamespace::for_side(connection.side());
        let limit = connection.config().max_concurrent_requests;
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            connection,
            namespace,
            negotiated,
            marshalling,
            resolver,
            outbound_clients: IdTable::new("outbound clients"),
            inbound_clients: IdTable::new("inbound clients"),
            outbound_requests: IdTable::new("outbound requests"),
            inbound_requests: IdTable::new("inbound requests"),
            request_limit: Arc::new(Semaphore::new(limit)),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn side(&self) -> Side {
        self.connection.side()
    }

    /// Versions, peer name and identity agreed during setup.
    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    /// Ask the peer for a client of `(service_type, group_name)`.
    pub async fn open_service(
        self: &Arc<Self>,
        service_type: &str,
        group_name: &str,
    ) -> Result<RemoteClient> {
        let (tx, rx) = oneshot::channel();
        let client = self.outbound_clients.insert_new(self.namespace, |id| {
            Arc::new(OutboundClientHandle::new(id, service_type, group_name, tx))
        })?;
        let id = client.id();
        debug!(id, service_type, group_name, "Opening service");

        let request = ServiceRequest {
            id,
            service_type: service_type.to_string(),
            group_name: group_name.to_string(),
        };
        if let Err(e) = self
            .connection
            .send(OutboundFrame::new(tags::SERVICE_REQUEST, request.encode()))
            .await
        {
            self.outbound_clients.remove(id);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(())) => Ok(RemoteClient::new(self.clone(), id)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MuxwireError::ConnectionClosed),
        }
    }

    /// Expose a local handler to the peer under a fresh id.
    pub fn export_client(self: &Arc<Self>, handler: Arc<dyn RequestHandler>) -> Result<ExportedClient> {
        let client = self
            .inbound_clients
            .insert_new(self.namespace, |id| Arc::new(InboundClientHandle::new(id, handler)))?;
        debug!(id = client.id(), "Client exported");
        Ok(ExportedClient::new(self.clone(), client.id()))
    }

    /// Client on the peer's side named by a reference received here.
    pub fn remote_client(self: &Arc<Self>, id: i32) -> Result<RemoteClient> {
        if self.connection.is_closed() {
            return Err(MuxwireError::ConnectionClosed);
        }
        Ok(RemoteClient::new(self.clone(), id))
    }

    /// Close the connection.
    pub fn close(&self) {
        self.connection.close();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    /// Wait until the connection has closed and every table was resolved.
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    pub fn table_sizes(&self) -> TableSizes {
        TableSizes {
            outbound_clients: self.outbound_clients.len(),
            inbound_clients: self.inbound_clients.len(),
            outbound_requests: self.outbound_requests.len(),
            inbound_requests: self.inbound_requests.len(),
        }
    }

    pub(crate) fn runtime(&self) -> &Handle {
        self.connection.runtime()
    }

    /// Marshal `value` with the negotiated marshaller.
    pub(crate) fn marshal(&self, value: &Value) -> Result<Bytes> {
        let mut marshaller = self
            .marshalling
            .create_marshaller(&self.negotiated.marshalling)?;
        let mut out = Vec::new();
        marshaller.write_value(&mut out, value)?;
        Ok(Bytes::from(out))
    }

    fn create_unmarshaller(&self) -> Result<Box<dyn Unmarshaller>> {
        self.marshalling
            .create_unmarshaller(&self.negotiated.marshalling)
    }

    /// Register an outbound request and start sending its chunks.
    pub(crate) fn start_request(
        self: &Arc<Self>,
        client_id: i32,
        payload: Bytes,
        outcome: OutcomeSender,
    ) -> Result<i32> {
        let window = self.connection.config().window_size;
        let request = self.outbound_requests.insert_new(self.namespace, |id| {
            Arc::new(OutboundRequest::new(id, client_id, window, outcome))
        })?;
        let id = request.id();
        trace!(id, client_id, len = payload.len(), "Request started");

        let writer = ChunkedWriter::new(
            self.connection.clone(),
            tags::REQUEST,
            id,
            request.permits().clone(),
        )
        .with_client(client_id);
        self.runtime().spawn(async move {
            match writer.send_all(&payload).await {
                Ok(()) => request.mark_sent(),
                // Cancellation, the reply or teardown resolves the outcome.
                Err(e) => debug!(id, error = %e, "Request transmission stopped"),
            }
        });
        Ok(id)
    }

    pub(crate) fn cancel_request(&self, id: i32) {
        let Some(request) = self.outbound_requests.get(id) else {
            return;
        };
        let Some(action) = request.cancel() else {
            return;
        };
        debug!(id, "Cancelling request");
        self.connection
            .send_detached(OutboundFrame::new(tags::REQUEST_ABORT, encode_id(id)));
        match action {
            Cancel::Pending(Some(outcome)) => outcome.fail(MuxwireError::Cancelled),
            Cancel::Pending(None) => {}
            Cancel::Receiving(reply) => reply.close(),
        }
        self.outbound_requests.remove(id);
        request.mark_closed();
    }

    pub(crate) async fn close_remote_client(&self, id: i32) -> Result<()> {
        debug!(id, "Closing remote client");
        self.connection
            .send(OutboundFrame::new(tags::CLIENT_CLOSED, encode_id(id)))
            .await
    }

    pub(crate) fn dispose_export(&self, id: i32) {
        if let Some(client) = self.inbound_clients.remove(id) {
            debug!(id, "Export withdrawn");
            client.close();
        }
    }

    /// The reply to `request` is done; drop the entry once its stream ends.
    pub(crate) fn conclude_inbound(&self, request: &Arc<InboundRequest>) {
        request.conclude();
        if request.relay().is_running() {
            request.relay().close();
        }
        if request.relay().is_closed() {
            self.inbound_requests.remove(request.id());
        }
    }

    fn ack_fn(&self, tag: u8, id: i32) -> AckFn {
        let connection = Arc::downgrade(&self.connection);
        Arc::new(move || {
            if let Some(connection) = connection.upgrade() {
                connection.send_detached(OutboundFrame::new(tag, encode_id(id)));
            }
        })
    }

    async fn dispatch_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let Frame { tag, body } = frame;
        match tag {
            tags::SERVICE_REQUEST => self.on_service_request(ServiceRequest::decode(body)?),
            tags::SERVICE_NOT_FOUND => self.on_open_result(decode_id(body)?, false),
            tags::SERVICE_CLIENT_OPENED => self.on_open_result(decode_id(body)?, true),
            tags::CLIENT_CLOSED => self.on_client_closed(decode_id(body)?),
            tags::REQUEST => {
                let (header, data) = ChunkHeader::decode(tag, body)?;
                self.on_request_chunk(header, data);
            }
            tags::REQUEST_ABORT => self.on_request_abort(decode_id(body)?),
            tags::REQUEST_ACK_CHUNK => {
                let id = decode_id(body)?;
                match self.outbound_requests.get(id) {
                    Some(request) => request.permits().release(),
                    None => debug!(id, "REQUEST_ACK_CHUNK for unknown request"),
                }
            }
            tags::REPLY_ACK_CHUNK => {
                let id = decode_id(body)?;
                match self.inbound_requests.get(id) {
                    Some(request) => request.permits().release(),
                    None => debug!(id, "REPLY_ACK_CHUNK for unknown request"),
                }
            }
            tags::REPLY | tags::REPLY_EXCEPTION => {
                let (header, data) = ChunkHeader::decode(tag, body)?;
                self.on_reply_chunk(header, data, tag == tags::REPLY_EXCEPTION);
            }
            tags::REPLY_EXCEPTION_ABORT => {
                let id = decode_id(body)?;
                match self.outbound_requests.remove(id) {
                    Some(request) => request.abort_exception(),
                    None => debug!(id, "REPLY_EXCEPTION_ABORT for unknown request"),
                }
            }
            other => return Err(MuxwireError::UnknownTag(other)),
        }
        Ok(())
    }

    fn on_service_request(&self, request: ServiceRequest) {
        let id = request.id;
        let reply = match self
            .resolver
            .resolve(&request.service_type, &request.group_name)
        {
            Some(handler) => {
                let client = Arc::new(InboundClientHandle::new(id, handler));
                match self.inbound_clients.insert(id, client) {
                    Ok(true) => {
                        debug!(id, service_type = %request.service_type, "Client opened");
                        tags::SERVICE_CLIENT_OPENED
                    }
                    Ok(false) => {
                        warn!(id, "Peer reused a client id");
                        tags::SERVICE_NOT_FOUND
                    }
                    Err(_) => return,
                }
            }
            None => {
                debug!(
                    id,
                    service_type = %request.service_type,
                    group_name = %request.group_name,
                    "No such service"
                );
                tags::SERVICE_NOT_FOUND
            }
        };
        self.connection
            .send_detached(OutboundFrame::new(reply, encode_id(id)));
    }

    fn on_open_result(&self, id: i32, opened: bool) {
        let Some(client) = self.outbound_clients.remove(id) else {
            debug!(id, opened, "Open result for unknown client");
            return;
        };
        let result = if opened {
            Ok(())
        } else {
            Err(MuxwireError::ServiceNotFound {
                service_type: client.service_type().to_string(),
                group_name: client.group_name().to_string(),
            })
        };
        client.resolve(result);
    }

    fn on_client_closed(&self, id: i32) {
        match self.inbound_clients.remove(id) {
            Some(client) => {
                debug!(id, "Client closed by peer");
                client.close();
            }
            None => debug!(id, "CLIENT_CLOSED for unknown client"),
        }
    }

    fn on_request_chunk(self: &Arc<Self>, header: ChunkHeader, data: Bytes) {
        let id = header.id;
        if let Some(client_id) = header.client_id {
            self.on_request_start(id, client_id, data, header.is_last());
            return;
        }
        let Some(request) = self.inbound_requests.get(id) else {
            debug!(id, "REQUEST chunk for unknown request");
            return;
        };
        request.relay().push(data, header.is_last());
        if header.is_last() && request.is_concluded() {
            self.inbound_requests.remove(id);
        }
    }

    fn on_request_start(self: &Arc<Self>, id: i32, client_id: i32, data: Bytes, last: bool) {
        let Some(client) = self.inbound_clients.get(client_id) else {
            debug!(id, client_id, "Request for unknown client");
            self.reject_request(id, client_id);
            return;
        };

        let ack = self.ack_fn(tags::REQUEST_ACK_CHUNK, id);
        let (input, reader) = bridge(ack.clone());
        let relay = Arc::new(StreamRelay::new(id, StreamSink::Bridge(input), ack));
        let window = self.connection.config().window_size;
        let request = Arc::new(InboundRequest::new(id, client_id, window, relay.clone()));
        match self.inbound_requests.insert(id, request.clone()) {
            Ok(true) => {}
            Ok(false) => {
                warn!(id, "Peer reused a request id");
                return;
            }
            Err(_) => return,
        }
        trace!(id, client_id, "Request received");
        relay.push(data, last);
        self.execute(request, client.handler(), reader);
    }

    /// Answer a request that has nowhere to go.
    fn reject_request(self: &Arc<Self>, id: i32, client_id: i32) {
        let exception = RemoteException::new(
            CLIENT_CLOSED,
            format!("client {} is not open", client_id),
        );
        let payload = match serde_json::to_value(&exception)
            .map_err(MuxwireError::from)
            .and_then(|value| self.marshal(&value))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(id, error = %e, "Could not marshal rejection");
                self.connection
                    .send_detached(OutboundFrame::new(tags::REPLY_EXCEPTION_ABORT, encode_id(id)));
                return;
            }
        };
        // No inbound entry exists for the id, so the peer's ACKs would find
        // nothing. The exception goes out as one FIRST|LAST chunk or not at all.
        match single_chunk(id, &payload, self.connection.buffer_pool().buffer_size()) {
            Some(body) => self
                .connection
                .send_detached(OutboundFrame::new(tags::REPLY_EXCEPTION, body)),
            None => {
                warn!(id, len = payload.len(), "Rejection does not fit one chunk");
                self.connection
                    .send_detached(OutboundFrame::new(tags::REPLY_EXCEPTION_ABORT, encode_id(id)));
            }
        }
    }

    /// Unmarshal the request on the blocking pool, then run its handler.
    fn execute(
        self: &Arc<Self>,
        request: Arc<InboundRequest>,
        target: Arc<dyn RequestHandler>,
        reader: BridgeReader,
    ) {
        let handler = self.clone();
        let task_request = request.clone();
        let task = self.runtime().spawn(async move {
            let request = task_request;
            let id = request.id();
            let Ok(_slot) = handler.request_limit.clone().acquire_owned().await else {
                return;
            };

            let unmarshaller = handler.create_unmarshaller();
            let ctx = UnmarshalContext::new(&handler);
            let read = tokio::task::spawn_blocking(move || read_payload(unmarshaller, reader, &ctx))
                .await
                .unwrap_or_else(|e| Err(MuxwireError::Marshalling(e.to_string())));
            let value = match read {
                Ok(value) => value,
                Err(_) if request.is_cancelled() => return,
                Err(e) => {
                    debug!(id, error = %e, "Request could not be unmarshalled");
                    let exception = RemoteException::from_error(UNMARSHALLING_ERROR, &e);
                    if let Err(e) =
                        send_reply(&handler, &request, ReplyBody::Exception(exception)).await
                    {
                        debug!(id, error = %e, "Unmarshalling error not reported");
                    }
                    return;
                }
            };

            if !request.begin_running() {
                return;
            }
            let reply = ReplyContext::new(handler.clone(), request.clone());
            let future = match catch_unwind(AssertUnwindSafe(|| target.receive_request(value, reply))) {
                Ok(future) => future,
                Err(_) => {
                    error!(id, "Request handler panicked");
                    return;
                }
            };
            if AssertUnwindSafe(future).catch_unwind().await.is_err() {
                error!(id, "Request handler panicked");
            }
        });
        request.set_execution(task.abort_handle());
    }

    fn on_request_abort(&self, id: i32) {
        match self.inbound_requests.remove(id) {
            Some(request) => {
                debug!(id, "Request aborted by peer");
                request.cancel(StreamFault::Interrupted);
            }
            None => debug!(id, "REQUEST_ABORT for unknown request"),
        }
    }

    fn on_reply_chunk(self: &Arc<Self>, header: ChunkHeader, data: Bytes, exception: bool) {
        let id = header.id;
        let Some(request) = self.outbound_requests.get(id) else {
            debug!(id, "Reply chunk for unknown request");
            return;
        };

        let reply = if header.is_first() {
            request.begin_reply(|outcome| self.start_reply(id, outcome, exception))
        } else {
            request.reply()
        };
        let Some(reply) = reply else {
            debug!(id, first = header.is_first(), "Reply chunk out of sequence");
            return;
        };

        reply.push(data, header.is_last());
        if header.is_last() {
            request.finish();
            self.outbound_requests.remove(id);
        }
    }

    /// Build the reply stream for `outcome` and start its consumer.
    fn start_reply(
        self: &Arc<Self>,
        id: i32,
        outcome: OutcomeSender,
        exception: bool,
    ) -> Arc<StreamRelay> {
        let ack = self.ack_fn(tags::REPLY_ACK_CHUNK, id);
        let relay = |sink: StreamSink| {
            if exception {
                StreamRelay::new_exception(id, sink, ack.clone())
            } else {
                StreamRelay::new(id, sink, ack.clone())
            }
        };
        match outcome {
            OutcomeSender::Value(tx) => {
                let (input, reader) = bridge(ack.clone());
                let unmarshaller = self.create_unmarshaller();
                let ctx = UnmarshalContext::new(self);
                self.runtime().spawn_blocking(move || {
                    let outcome = match read_payload(unmarshaller, reader, &ctx) {
                        Ok(value) if exception => Err(exception_from_value(value)),
                        Ok(value) => Ok(value),
                        Err(MuxwireError::ConnectionClosed) => Err(MuxwireError::IndeterminateOutcome),
                        Err(e) => Err(e),
                    };
                    let _ = tx.send(outcome);
                });
                Arc::new(relay(StreamSink::Bridge(input)))
            }
            OutcomeSender::Raw(tx) => {
                let (sink, chunks) = ChunkReceiver::channel(ack.clone());
                let _ = tx.send(Ok(RawReply::new(self.clone(), id, exception, chunks)));
                Arc::new(relay(sink))
            }
        }
    }

    /// Resolve every table entry after the connection closed.
    fn teardown(&self, reason: &CloseReason) {
        debug!(side = ?self.side(), reason = ?reason, "Tearing down connection handler");
        self.request_limit.close();

        resolve_each(&self.outbound_clients, |client| {
            client.resolve(Err(reason.to_error()));
        });
        resolve_each(&self.inbound_clients, |client| client.close());
        resolve_each(&self.outbound_requests, |request| request.teardown());
        resolve_each(&self.inbound_requests, |request| {
            request.cancel(StreamFault::ConnectionClosed);
        });
    }
}

/// Drain `table` and run `resolve` on each entry, outside the table lock.
///
/// A panicking entry is logged and the pass continues.
fn resolve_each<T, F>(table: &IdTable<T>, resolve: F)
where
    F: Fn(T),
{
    let entries = table.drain();
    if !entries.is_empty() {
        debug!(table = table.name(), count = entries.len(), "Resolving entries");
    }
    for entry in entries {
        if catch_unwind(AssertUnwindSafe(|| resolve(entry))).is_err() {
            error!(table = table.name(), "Entry panicked during teardown");
        }
    }
}

impl FrameHandler for ConnectionHandler {
    fn handle_frame<'a>(
        &'a self,
        _connection: &'a Arc<Connection>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if tags::is_handshake(frame.tag) {
                warn!(tag = frame.tag_name(), "Handshake frame after authentication");
                return Err(MuxwireError::UnknownTag(frame.tag));
            }
            let Some(this) = self.self_ref.upgrade() else {
                return Ok(());
            };
            this.dispatch_frame(frame).await
        })
    }

    fn handle_close(&self, _connection: &Arc<Connection>, reason: &CloseReason) {
        self.teardown(reason);
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("side", &self.side())
            .field("negotiated", &self.negotiated)
            .field("tables", &self.table_sizes())
            .finish()
    }
}
