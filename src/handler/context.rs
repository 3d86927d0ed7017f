//! Reply side of an inbound request.
//!
//! # Example
//!
//! ```ignore
//! async fn add(args: (i64, i64), ctx: ReplyContext) -> Result<()> {
//!     ctx.reply(&json!(args.0 + args.1)).await
//! }
//!
//! async fn refuse(_: Value, ctx: ReplyContext) -> Result<()> {
//!     ctx.reply_exception(RemoteException::new("Denied", "not today")).await
//! }
//! ```

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use super::{ConnectionHandler, RemoteClient};
use crate::error::{RemoteException, Result};
use crate::marshal::{client_ref_id, Value};
use crate::request::{send_reply, InboundRequest, ReplyBody, NO_REPLY};

/// Handed to a [`RequestHandler`](super::RequestHandler) with each request.
///
/// Every reply method consumes the context, so a request is answered at
/// most once. A context dropped without replying answers with a
/// `NoReply` exception.
pub struct ReplyContext {
    handler: Arc<ConnectionHandler>,
    request: Arc<InboundRequest>,
    replied: bool,
}

impl ReplyContext {
    pub(crate) fn new(handler: Arc<ConnectionHandler>, request: Arc<InboundRequest>) -> Self {
        Self {
            handler,
            request,
            replied: false,
        }
    }

    #[inline]
    pub fn request_id(&self) -> i32 {
        self.request.id()
    }

    /// Id of the client the request was addressed to.
    #[inline]
    pub fn client_id(&self) -> i32 {
        self.request.client_id()
    }

    /// True once the peer aborted the request or the connection closed.
    pub fn is_cancelled(&self) -> bool {
        self.request.is_cancelled()
    }

    /// Connection the request arrived on.
    pub fn connection(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    /// Client behind a `{"$client": id}` reference found in the request.
    pub fn client(&self, value: &Value) -> Option<Result<RemoteClient>> {
        client_ref_id(value).map(|id| self.handler.remote_client(id))
    }

    /// Reply with a value.
    pub async fn reply(mut self, value: &Value) -> Result<()> {
        self.replied = true;
        send_reply(&self.handler, &self.request, ReplyBody::Value(value.clone())).await
    }

    /// Reply with an exception.
    pub async fn reply_exception(mut self, exception: RemoteException) -> Result<()> {
        self.replied = true;
        send_reply(&self.handler, &self.request, ReplyBody::Exception(exception)).await
    }

    /// Reply with bytes that bypass the marshaller.
    pub async fn reply_raw(mut self, data: Bytes) -> Result<()> {
        self.replied = true;
        send_reply(&self.handler, &self.request, ReplyBody::Raw(data)).await
    }
}

impl Drop for ReplyContext {
    fn drop(&mut self) {
        if self.replied || self.request.is_concluded() {
            return;
        }
        let handler = self.handler.clone();
        let request = self.request.clone();
        debug!(id = request.id(), "Request finished without a reply");
        self.handler.runtime().spawn(async move {
            let exception = RemoteException::new(NO_REPLY, "request handler did not reply");
            if let Err(e) = send_reply(&handler, &request, ReplyBody::Exception(exception)).await {
                debug!(id = request.id(), error = %e, "NoReply not sent");
            }
        });
    }
}

impl std::fmt::Debug for ReplyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyContext")
            .field("request_id", &self.request.id())
            .field("client_id", &self.request.client_id())
            .field("replied", &self.replied)
            .finish()
    }
}
