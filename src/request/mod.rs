//! Request and reply lifecycles.
//!
//! - [`outbound`]: requests this side sent and their replies
//! - [`inbound`]: requests the peer sent and the replies sent back
//! - [`chunked`]: flow-controlled chunk writer used by both directions

mod chunked;
mod inbound;
mod outbound;

pub(crate) use chunked::{single_chunk, ChunkedWriter};
pub(crate) use inbound::InboundRequest;
pub(crate) use outbound::{Cancel, OutboundRequest, OutcomeSender};
pub use outbound::{PendingReply, RawReply};

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{MuxwireError, RemoteException, Result};
use crate::handler::ConnectionHandler;
use crate::marshal::{UnmarshalContext, Unmarshaller, Value};
use crate::protocol::{encode_id, tags};
use crate::stream::BridgeReader;
use crate::writer::OutboundFrame;

/// Exception kind sent when a handler finishes without replying.
pub const NO_REPLY: &str = "NoReply";

/// Read one value from a chunk stream.
///
/// Blocks the calling thread. The stream is always read to its end so every
/// chunk gets acknowledged; a stream fault takes precedence over the
/// unmarshaller's own error.
pub(crate) fn read_payload(
    unmarshaller: Result<Box<dyn Unmarshaller>>,
    mut reader: BridgeReader,
    ctx: &UnmarshalContext,
) -> Result<Value> {
    let result = unmarshaller.and_then(|mut u| u.read_value(&mut reader, ctx));
    reader.drain();
    if let Some(fault) = reader.fault() {
        return Err(fault.into_error());
    }
    result
}

/// Turn an exception payload into the error the caller sees.
pub(crate) fn exception_from_value(value: Value) -> MuxwireError {
    match serde_json::from_value::<RemoteException>(value.clone()) {
        Ok(exception) => MuxwireError::Remote(exception),
        Err(_) => MuxwireError::Remote(RemoteException::new("Unknown", value.to_string())),
    }
}

/// What a reply carries.
pub(crate) enum ReplyBody {
    Value(Value),
    Exception(RemoteException),
    Raw(Bytes),
}

/// Send the reply to `request` and conclude it.
///
/// A value that fails to marshal is answered with an exception instead; an
/// exception that fails to marshal is answered with REPLY_EXCEPTION_ABORT.
/// Either way the marshalling error is returned.
pub(crate) async fn send_reply(
    handler: &Arc<ConnectionHandler>,
    request: &Arc<InboundRequest>,
    body: ReplyBody,
) -> Result<()> {
    let id = request.id();
    let mut failure = None;
    let (exception, payload) = match body {
        ReplyBody::Value(value) => match handler.marshal(&value) {
            Ok(bytes) => (false, Ok(bytes)),
            Err(e) => {
                warn!(id, error = %e, "Reply value could not be marshalled");
                let exception = RemoteException::from_error("MarshallingError", &e);
                failure = Some(e);
                (true, marshal_exception(handler, &exception))
            }
        },
        ReplyBody::Exception(exception) => (true, marshal_exception(handler, &exception)),
        ReplyBody::Raw(bytes) => (false, Ok(bytes)),
    };

    if !request.begin_reply(exception) {
        debug!(id, "Reply dropped, request already concluded");
        return Err(MuxwireError::Cancelled);
    }

    let result = match payload {
        Ok(bytes) => {
            let tag = if exception {
                tags::REPLY_EXCEPTION
            } else {
                tags::REPLY
            };
            ChunkedWriter::new(
                handler.connection().clone(),
                tag,
                id,
                request.permits().clone(),
            )
            .send_all(&bytes)
            .await
        }
        Err(e) => {
            warn!(id, error = %e, "Exception reply could not be marshalled");
            handler
                .connection()
                .send_detached(OutboundFrame::new(tags::REPLY_EXCEPTION_ABORT, encode_id(id)));
            Err(e)
        }
    };

    handler.conclude_inbound(request);
    match failure {
        Some(e) => Err(e),
        None => result,
    }
}

fn marshal_exception(handler: &ConnectionHandler, exception: &RemoteException) -> Result<Bytes> {
    let value = serde_json::to_value(exception)?;
    handler.marshal(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{MarshallerFactory, MarshallingConfig, StandardMarshalling};
    use crate::stream::{bridge, StreamFault};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unmarshaller() -> Result<Box<dyn Unmarshaller>> {
        StandardMarshalling::new().create_unmarshaller(&MarshallingConfig::new(1))
    }

    #[test]
    fn test_read_payload_acks_every_chunk() {
        let acks = Arc::new(AtomicUsize::new(0));
        let counter = acks.clone();
        let (input, reader) = bridge(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        input.push(Bytes::from_static(b"{\"a\":"));
        input.push(Bytes::from_static(b"[1,2]"));
        input.push_last(Bytes::from_static(b"}"));

        let value = read_payload(unmarshaller(), reader, &UnmarshalContext::detached()).unwrap();
        assert_eq!(value, json!({"a": [1, 2]}));
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_fault_wins_over_parse_error() {
        let (input, reader) = bridge(Arc::new(|| {}));
        input.push(Bytes::from_static(b"{\"a\""));
        input.push_exception(StreamFault::Cancelled);

        let err = read_payload(unmarshaller(), reader, &UnmarshalContext::detached()).unwrap_err();
        assert!(matches!(err, MuxwireError::Cancelled));
    }

    #[test]
    fn test_malformed_payload_still_drained() {
        let acks = Arc::new(AtomicUsize::new(0));
        let counter = acks.clone();
        let (input, reader) = bridge(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        input.push(Bytes::from_static(b"not json"));
        input.push(Bytes::from_static(b"more"));
        input.push_eof();

        assert!(read_payload(unmarshaller(), reader, &UnmarshalContext::detached()).is_err());
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_exception_value_mapping() {
        let err = exception_from_value(json!({"kind": "Boom", "message": "bad"}));
        match err {
            MuxwireError::Remote(e) => assert_eq!(e, RemoteException::new("Boom", "bad")),
            other => panic!("unexpected {other:?}"),
        }
        match exception_from_value(json!(42)) {
            MuxwireError::Remote(e) => assert_eq!(e.kind, "Unknown"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
