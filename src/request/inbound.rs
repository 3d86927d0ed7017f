//! Requests the peer sent, executing locally.
//!
//! ```text
//! Receiving ──value read──► Running ──reply──► Sending ──LAST sent──► Closed
//!     │                        │      └─exception─► SendingException ─┘
//!     └──── REQUEST_ABORT / teardown ─────────────────────────────────► Closed (cancelled)
//! ```
//!
//! The entry stays in the inbound table until both the reply has concluded
//! and the request stream has stopped running, so late request chunks are
//! still acknowledged and discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use crate::flow_control::PermitPool;
use crate::stream::{StreamFault, StreamRelay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InboundState {
    Receiving,
    Running,
    Sending,
    SendingException,
    Closed,
}

pub(crate) struct InboundRequest {
    id: i32,
    client_id: i32,
    state: Mutex<InboundState>,
    cancelled: AtomicBool,
    permits: PermitPool,
    relay: Arc<StreamRelay>,
    execution: Mutex<Option<AbortHandle>>,
}

impl InboundRequest {
    pub fn new(id: i32, client_id: i32, window: usize, relay: Arc<StreamRelay>) -> Self {
        Self {
            id,
            client_id,
            state: Mutex::new(InboundState::Receiving),
            cancelled: AtomicBool::new(false),
            permits: PermitPool::new(window),
            relay,
            execution: Mutex::new(None),
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

    pub fn relay(&self) -> &Arc<StreamRelay> {
        &self.relay
    }

    pub fn state(&self) -> InboundState {
        *self.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The reply has been fully sent, or the request was cancelled.
    pub fn is_concluded(&self) -> bool {
        self.state() == InboundState::Closed
    }

    /// Remember the execution task so an abort can stop it.
    pub fn set_execution(&self, handle: AbortHandle) {
        let mut execution = self.execution.lock();
        if self.is_cancelled() {
            handle.abort();
        } else {
            *execution = Some(handle);
        }
    }

    /// The request value has been read; the local handler takes over.
    ///
    /// `false` if the request was cancelled meanwhile.
    pub fn begin_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state == InboundState::Receiving {
            *state = InboundState::Running;
            true
        } else {
            false
        }
    }

    /// Claim the reply path. Only the first caller wins.
    pub fn begin_reply(&self, exception: bool) -> bool {
        let mut state = self.state.lock();
        match *state {
            InboundState::Receiving | InboundState::Running => {
                *state = if exception {
                    InboundState::SendingException
                } else {
                    InboundState::Sending
                };
                true
            }
            _ => false,
        }
    }

    /// The reply is done; stop accepting anything on the reply path.
    pub fn conclude(&self) {
        *self.state.lock() = InboundState::Closed;
        self.permits.close();
    }

    /// Abort the request: the peer asked for it, or the connection closed.
    pub fn cancel(&self, fault: StreamFault) {
        self.cancelled.store(true, Ordering::Release);
        self.conclude();
        self.relay.push_exception(fault);
        let execution = self.execution.lock().take();
        if let Some(handle) = execution {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundRequest")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .field("stream", &self.relay.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{bridge, StreamSink, StreamState};

    fn request() -> InboundRequest {
        let (input, _reader) = bridge(Arc::new(|| {}));
        let relay = Arc::new(StreamRelay::new(1, StreamSink::Bridge(input), Arc::new(|| {})));
        InboundRequest::new(1, 2, 5, relay)
    }

    #[test]
    fn test_single_reply() {
        let request = request();
        assert!(request.begin_running());
        assert!(request.begin_reply(false));
        assert_eq!(request.state(), InboundState::Sending);
        assert!(!request.begin_reply(true));
        request.conclude();
        assert!(request.is_concluded());
        assert!(!request.is_cancelled());
    }

    #[test]
    fn test_exception_from_receiving() {
        let request = request();
        assert!(request.begin_reply(true));
        assert_eq!(request.state(), InboundState::SendingException);
        assert!(!request.begin_running());
    }

    #[tokio::test]
    async fn test_cancel_aborts_execution() {
        let request = request();
        let task = tokio::spawn(std::future::pending::<()>());
        request.set_execution(task.abort_handle());

        request.cancel(StreamFault::Interrupted);
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(request.is_cancelled());
        assert!(request.permits().is_closed());
        assert_eq!(request.relay().state(), StreamState::Closed);
        assert!(!request.begin_reply(false));
    }

    #[tokio::test]
    async fn test_execution_registered_after_cancel() {
        let request = request();
        request.cancel(StreamFault::ConnectionClosed);

        let task = tokio::spawn(std::future::pending::<()>());
        request.set_execution(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
