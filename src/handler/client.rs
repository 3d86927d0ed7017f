//! Client handles on both ends of a connection.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{ConnectionHandler, RequestHandler};
use crate::close::CloseNotifier;
use crate::error::Result;
use crate::marshal::{client_ref, Value};
use crate::request::{OutcomeSender, PendingReply, RawReply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    Waiting,
    Established,
    Closed,
}

/// A SERVICE_REQUEST this side sent, waiting for the peer's answer.
pub(crate) struct OutboundClientHandle {
    id: i32,
    service_type: String,
    group_name: String,
    state: Mutex<ClientState>,
    waiter: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

impl OutboundClientHandle {
    pub fn new(
        id: i32,
        service_type: &str,
        group_name: &str,
        waiter: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            id,
            service_type: service_type.to_string(),
            group_name: group_name.to_string(),
            state: Mutex::new(ClientState::Waiting),
            waiter: Mutex::new(Some(waiter)),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Deliver the open result. Only the first call has an effect.
    pub fn resolve(&self, result: Result<()>) {
        {
            let mut state = self.state.lock();
            if *state != ClientState::Waiting {
                return;
            }
            *state = if result.is_ok() {
                ClientState::Established
            } else {
                ClientState::Closed
            };
        }
        if let Some(waiter) = self.waiter.lock().take() {
            // The opener may have given up waiting.
            let _ = waiter.send(result);
        }
    }
}

/// A local handler exposed to the peer under an id.
pub(crate) struct InboundClientHandle {
    id: i32,
    handler: Arc<dyn RequestHandler>,
    close: CloseNotifier,
}

impl InboundClientHandle {
    pub fn new(id: i32, handler: Arc<dyn RequestHandler>) -> Self {
        let close = CloseNotifier::new();
        let target = handler.clone();
        close.add_handler(move || target.close());
        Self { id, handler, close }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        self.handler.clone()
    }

    /// Close the client, notifying its handler once.
    pub fn close(&self) {
        self.close.close();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }
}

/// A client on the peer's side of the connection.
///
/// Obtained from [`ConnectionHandler::open_service`] or from a client
/// reference received in a value. Cheap to clone.
///
/// Dropping a `RemoteClient` does not close it: clones and references
/// share one id and any of them may still be in use. The peer keeps the
/// client until [`close`](Self::close) is called or the connection ends,
/// so a long-lived connection should close the services it opens.
#[derive(Clone)]
pub struct RemoteClient {
    handler: Arc<ConnectionHandler>,
    id: i32,
}

impl RemoteClient {
    pub(crate) fn new(handler: Arc<ConnectionHandler>, id: i32) -> Self {
        Self { handler, id }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Start a request carrying `value`.
    ///
    /// The value is marshalled immediately; its chunks are sent in the
    /// background under flow control.
    pub fn send(&self, value: &Value) -> Result<PendingReply<Value>> {
        let payload = self.handler.marshal(value)?;
        let (tx, rx) = oneshot::channel();
        let id = self
            .handler
            .start_request(self.id, payload, OutcomeSender::Value(tx))?;
        Ok(PendingReply::new(self.handler.clone(), id, rx))
    }

    /// Send a request and wait for its reply.
    pub async fn invoke(&self, value: &Value) -> Result<Value> {
        self.send(value)?.outcome().await
    }

    /// Start a request with a payload that bypasses the marshaller.
    ///
    /// The reply is delivered as raw chunks.
    pub fn send_raw(&self, data: Bytes) -> Result<PendingReply<RawReply>> {
        let (tx, rx) = oneshot::channel();
        let id = self
            .handler
            .start_request(self.id, data, OutcomeSender::Raw(tx))?;
        Ok(PendingReply::new(self.handler.clone(), id, rx))
    }

    /// Tell the peer this client is no longer used.
    pub async fn close(self) -> Result<()> {
        self.handler.close_remote_client(self.id).await
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient").field("id", &self.id).finish()
    }
}

/// A local handler exported to the peer, not yet handed over.
///
/// Must be consumed: [`into_value`](Self::into_value) produces the
/// reference to embed in a request or reply, [`dispose`](Self::dispose)
/// withdraws the export. Dropping it unconsumed disposes it.
#[must_use = "an exported client is withdrawn when dropped"]
pub struct ExportedClient {
    handler: Arc<ConnectionHandler>,
    id: i32,
    consumed: bool,
}

impl ExportedClient {
    pub(crate) fn new(handler: Arc<ConnectionHandler>, id: i32) -> Self {
        Self {
            handler,
            id,
            consumed: false,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// The `{"$client": id}` value to send to the peer.
    pub fn into_value(mut self) -> Value {
        self.consumed = true;
        client_ref(self.id)
    }

    /// Withdraw the export and close its handler.
    pub fn dispose(mut self) {
        self.consumed = true;
        self.handler.dispose_export(self.id);
    }
}

impl Drop for ExportedClient {
    fn drop(&mut self) {
        if !self.consumed {
            self.handler.dispose_export(self.id);
        }
    }
}

impl std::fmt::Debug for ExportedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedClient")
            .field("id", &self.id)
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MuxwireError;
    use crate::handler::{BoxFuture, ReplyContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Closing(Arc<AtomicUsize>);

    impl RequestHandler for Closing {
        fn receive_request(&self, _request: Value, _reply: ReplyContext) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }

        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_inbound_close_runs_once() {
        let closed = Arc::new(AtomicUsize::new(0));
        let client = InboundClientHandle::new(4, Arc::new(Closing(closed.clone())));
        client.close();
        client.close();
        assert!(client.is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outbound_resolves_once() {
        let (tx, rx) = oneshot::channel();
        let client = OutboundClientHandle::new(9, "svc", "grp", tx);
        client.resolve(Err(MuxwireError::ServiceNotFound {
            service_type: "svc".to_string(),
            group_name: "grp".to_string(),
        }));
        client.resolve(Ok(()));

        assert!(matches!(
            rx.await.unwrap(),
            Err(MuxwireError::ServiceNotFound { .. })
        ));
        assert_eq!(client.state(), ClientState::Closed);
    }
}
