//! Chunked payload relay.
//!
//! Request and reply payloads arrive as a run of chunk frames ending with a
//! LAST chunk. A [`StreamRelay`] tracks where one such run stands and
//! forwards each chunk to exactly one sink chosen at creation:
//!
//! - [`StreamSink::Bridge`]: a blocking byte input read by an unmarshaller
//! - [`StreamSink::Output`]: a channel drained by a [`ChunkReceiver`]
//! - [`StreamSink::Relay`]: another relay
//!
//! ```text
//! WaitingFirst ──push──► Running ──push(last)──► Closed
//!      │                    │
//!      │                  close() ─► CloseWait ──push(last)──► Closed
//!      └── push_exception / push(last) ────────────────────────► Closed
//! ```

mod bridge;

pub use bridge::{bridge, AckFn, BridgeReader, ByteInputBridge};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{MuxwireError, Result};

/// Reason a stream ended without its LAST chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFault {
    /// The peer aborted the request.
    Interrupted,
    /// The connection closed.
    ConnectionClosed,
    /// The local consumer cancelled.
    Cancelled,
    /// The peer gave up sending an exception reply.
    ExceptionAborted,
}

impl StreamFault {
    pub fn into_error(self) -> MuxwireError {
        match self {
            StreamFault::Interrupted => {
                MuxwireError::Interrupted("request aborted by peer".to_string())
            }
            StreamFault::ConnectionClosed => MuxwireError::ConnectionClosed,
            StreamFault::Cancelled => MuxwireError::Cancelled,
            StreamFault::ExceptionAborted => MuxwireError::ReplyExceptionAborted,
        }
    }
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StreamFault::Interrupted => "stream interrupted",
            StreamFault::ConnectionClosed => "connection closed",
            StreamFault::Cancelled => "stream cancelled",
            StreamFault::ExceptionAborted => "exception reply aborted",
        };
        f.write_str(text)
    }
}

/// Relay states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    WaitingFirst,
    WaitingFirstException,
    Running,
    /// Consumer gave up; remaining chunks are discarded until LAST.
    CloseWait,
    Closed,
}

/// Item delivered to an output sink.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk { data: Bytes, last: bool },
    Fault(StreamFault),
}

/// Where a relay forwards chunks.
pub enum StreamSink {
    Bridge(ByteInputBridge),
    Output(mpsc::UnboundedSender<StreamEvent>),
    Relay(Arc<StreamRelay>),
}

/// Forwarding state for one chunked payload.
pub struct StreamRelay {
    id: i32,
    state: Mutex<StreamState>,
    sink: StreamSink,
    ack: AckFn,
}

impl StreamRelay {
    /// Relay for a normal payload.
    ///
    /// `ack` runs for chunks the relay consumes itself: those discarded in
    /// `CloseWait` and those handed to a sink that acknowledges on delivery.
    pub fn new(id: i32, sink: StreamSink, ack: AckFn) -> Self {
        Self::with_state(id, sink, ack, StreamState::WaitingFirst)
    }

    /// Relay for an exception payload.
    pub fn new_exception(id: i32, sink: StreamSink, ack: AckFn) -> Self {
        Self::with_state(id, sink, ack, StreamState::WaitingFirstException)
    }

    fn with_state(id: i32, sink: StreamSink, ack: AckFn, state: StreamState) -> Self {
        Self {
            id,
            state: Mutex::new(state),
            sink,
            ack,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// True while chunks are still expected and wanted.
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            StreamState::WaitingFirst | StreamState::WaitingFirstException | StreamState::Running
        )
    }

    /// True once LAST or a fault has been seen.
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Forward one chunk.
    pub fn push(&self, data: Bytes, last: bool) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                StreamState::WaitingFirst
                | StreamState::WaitingFirstException
                | StreamState::Running => {
                    *state = if last {
                        StreamState::Closed
                    } else {
                        StreamState::Running
                    };
                }
                StreamState::CloseWait if last => *state = StreamState::Closed,
                StreamState::CloseWait | StreamState::Closed => {}
            }
            previous
        };

        match previous {
            StreamState::CloseWait => {
                trace!(id = self.id, last, "Discarding chunk after close");
                if !last {
                    (self.ack)();
                }
            }
            StreamState::Closed => {
                trace!(id = self.id, "Chunk after end of stream ignored");
            }
            _ => self.forward(data, last),
        }
    }

    /// End the stream without more data.
    pub fn push_eof(&self) {
        self.push(Bytes::new(), true);
    }

    /// End the stream with a fault.
    pub fn push_exception(&self, fault: StreamFault) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, StreamState::Closed)
        };
        if previous != StreamState::Closed {
            self.fault_sink(fault);
        }
    }

    /// Local consumer lost interest.
    ///
    /// The sink sees `Cancelled`; chunks still in flight are discarded and
    /// acknowledged until the producer's LAST arrives.
    pub fn close(&self) {
        let was_running = {
            let mut state = self.state.lock();
            let running = matches!(
                *state,
                StreamState::WaitingFirst
                    | StreamState::WaitingFirstException
                    | StreamState::Running
            );
            if running {
                *state = StreamState::CloseWait;
            }
            running
        };
        if was_running {
            self.fault_sink(StreamFault::Cancelled);
        }
    }

    fn forward(&self, data: Bytes, last: bool) {
        match &self.sink {
            StreamSink::Bridge(bridge) => {
                if last {
                    bridge.push_last(data);
                } else {
                    bridge.push(data);
                }
            }
            StreamSink::Output(tx) => {
                if tx.send(StreamEvent::Chunk { data, last }).is_err() && !last {
                    // Receiver is gone; nobody else will acknowledge.
                    (self.ack)();
                }
            }
            StreamSink::Relay(next) => {
                next.push(data, last);
                if !last {
                    (self.ack)();
                }
            }
        }
    }

    fn fault_sink(&self, fault: StreamFault) {
        match &self.sink {
            StreamSink::Bridge(bridge) => bridge.push_exception(fault),
            StreamSink::Output(tx) => {
                let _ = tx.send(StreamEvent::Fault(fault));
            }
            StreamSink::Relay(next) => next.push_exception(fault),
        }
    }
}

impl fmt::Debug for StreamRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRelay")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Consumer of an output sink.
///
/// Each chunk is acknowledged as it is received.
pub struct ChunkReceiver {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    ack: AckFn,
    finished: bool,
}

impl ChunkReceiver {
    /// Create an output sink and its receiver.
    pub fn channel(ack: AckFn) -> (StreamSink, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamSink::Output(tx),
            Self {
                rx,
                ack,
                finished: false,
            },
        )
    }

    /// Next chunk of data; `Ok(None)` after the LAST chunk.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(StreamEvent::Chunk { data, last }) => {
                if last {
                    self.finished = true;
                } else {
                    (self.ack)();
                }
                Ok(Some(data))
            }
            Some(StreamEvent::Fault(fault)) => {
                self.finished = true;
                Err(fault.into_error())
            }
            None => {
                self.finished = true;
                Err(MuxwireError::ConnectionClosed)
            }
        }
    }

    /// Collect the remaining chunks into one buffer.
    pub async fn collect(mut self) -> Result<Bytes> {
        let mut out = Vec::new();
        while let Some(data) = self.recv().await? {
            out.extend_from_slice(&data);
        }
        Ok(Bytes::from(out))
    }
}

impl fmt::Debug for ChunkReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkReceiver")
            .field("finished", &self.finished)
            .finish()
    }
}
