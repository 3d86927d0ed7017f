//! Framed connection.
//!
//! A [`Connection`] owns one byte channel. The read half runs in a read loop
//! task that extracts frames and feeds them, in order, to the currently
//! installed [`FrameHandler`]. The write half belongs to the writer task.
//!
//! The frame handler is swappable: the handshake installs itself first and
//! replaces itself with the steady-state handler once authentication
//! completes. On close the active handler is swapped for a closed placeholder,
//! told about the close, and then the close observers run.
//!
//! # Lifecycle
//!
//! ```text
//! start ─► read loop ─► EOF / I/O error / protocol error / close()
//!                              │
//!                              ▼
//!          cancel shutdown token (writer shuts the write half down)
//!          swap handler ─► handler.handle_close ─► close observers
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::buffer_pool::BufferPool;
use crate::close::CloseNotifier;
use crate::config::{ConnectionConfig, Side};
use crate::error::{MuxwireError, Result};
use crate::handler::BoxFuture;
use crate::protocol::{Frame, FrameBuffer};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Why a connection stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally, or the writer stopped.
    Local,
    /// The peer closed the byte channel.
    Eof,
    /// Reading failed.
    Io(String),
    /// The peer violated the protocol.
    Protocol(String),
}

impl CloseReason {
    /// Error to hand to anyone still waiting on the connection.
    pub fn to_error(&self) -> MuxwireError {
        match self {
            CloseReason::Local | CloseReason::Eof => MuxwireError::ConnectionClosed,
            CloseReason::Io(message) => MuxwireError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                message.clone(),
            )),
            CloseReason::Protocol(message) => MuxwireError::Protocol(message.clone()),
        }
    }
}

/// Receives every frame read from a connection.
pub trait FrameHandler: Send + Sync + 'static {
    /// Handle one frame.
    ///
    /// Frames are delivered one at a time in arrival order. Returning an
    /// error closes the connection.
    fn handle_frame<'a>(
        &'a self,
        connection: &'a Arc<Connection>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<()>>;

    /// The connection closed while this handler was active.
    fn handle_close(&self, connection: &Arc<Connection>, reason: &CloseReason);
}

/// Handler installed after close. Drops everything.
struct ClosedHandler;

impl FrameHandler for ClosedHandler {
    fn handle_frame<'a>(
        &'a self,
        _connection: &'a Arc<Connection>,
        frame: Frame,
    ) -> BoxFuture<'a, Result<()>> {
        trace!(tag = frame.tag_name(), "Frame after close ignored");
        Box::pin(async { Ok(()) })
    }

    fn handle_close(&self, _connection: &Arc<Connection>, _reason: &CloseReason) {}
}

/// One framed byte channel.
pub struct Connection {
    side: Side,
    config: Arc<ConnectionConfig>,
    writer: WriterHandle,
    buffer_pool: BufferPool,
    handler: Mutex<Arc<dyn FrameHandler>>,
    close_notifier: CloseNotifier,
    shutdown: CancellationToken,
    terminated: CancellationToken,
    runtime: Handle,
}

impl Connection {
    /// Take ownership of `stream` and start the read loop and writer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(
        stream: S,
        side: Side,
        config: Arc<ConnectionConfig>,
        handler: Arc<dyn FrameHandler>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let shutdown = CancellationToken::new();
        let (writer, _writer_task) =
            spawn_writer_task(writer, config.write_channel_capacity, shutdown.clone());

        let connection = Arc::new(Self {
            side,
            buffer_pool: BufferPool::with_capacity(config.buffer_pool_capacity, config.buffer_size),
            config,
            writer,
            handler: Mutex::new(handler),
            close_notifier: CloseNotifier::new(),
            shutdown,
            terminated: CancellationToken::new(),
            runtime: Handle::current(),
        });

        tokio::spawn(read_loop(connection.clone(), reader));
        connection
    }

    /// Which end of the channel this is.
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn config(&self) -> &Arc<ConnectionConfig> {
        &self.config
    }

    /// Pool of send buffers.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// Runtime the connection's tasks run on.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Install a new frame handler.
    ///
    /// The next frame read goes to `handler`. Ignored once closed.
    pub fn set_frame_handler(&self, handler: Arc<dyn FrameHandler>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        *self.handler.lock() = handler;
    }

    /// Queue a frame, waiting while the writer channel is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(MuxwireError::ConnectionClosed);
        }
        self.writer.send(frame).await
    }

    /// Queue a frame without waiting. Dropped silently once closed.
    pub fn send_detached(&self, frame: OutboundFrame) {
        if self.shutdown.is_cancelled() {
            trace!(tag = frame.tag(), "Dropping frame on closed connection");
            return;
        }
        self.writer.send_detached(frame);
    }

    /// Write everything queued so far, then close.
    pub async fn flush_and_close(&self) {
        self.writer.request_shutdown().await;
    }

    /// Close immediately. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// True once close has started.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Wait until close has finished, observers included.
    pub async fn closed(&self) {
        self.terminated.cancelled().await;
    }

    /// Run `handler` once the connection has closed.
    pub fn add_close_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.close_notifier.add_handler(handler);
    }

    async fn read_frames<R>(self: &Arc<Self>, reader: &mut R) -> CloseReason
    where
        R: AsyncRead + Unpin,
    {
        let mut frame_buffer = FrameBuffer::with_capacity_and_max_frame(
            self.config.read_buffer_size,
            self.config.max_frame_size,
        );
        let mut buf = vec![0u8; self.config.read_buffer_size];

        loop {
            let n = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return CloseReason::Local,
                result = reader.read(&mut buf) => match result {
                    Ok(0) => return CloseReason::Eof,
                    Ok(n) => n,
                    Err(e) => return CloseReason::Io(e.to_string()),
                },
            };

            let frames = match frame_buffer.push(&buf[..n]) {
                Ok(frames) => frames,
                Err(e) => return CloseReason::Protocol(e.to_string()),
            };

            for frame in frames {
                trace!(tag = frame.tag_name(), len = frame.body_len(), "Frame received");
                let handler = self.handler.lock().clone();
                let result = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => return CloseReason::Local,
                    result = handler.handle_frame(self, frame) => result,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Closing connection after frame handling failed");
                    return CloseReason::Protocol(e.to_string());
                }
            }
        }
    }

    fn teardown(self: &Arc<Self>, reason: CloseReason) {
        debug!(side = ?self.side, reason = ?reason, "Connection closing");
        self.shutdown.cancel();

        let handler: Arc<dyn FrameHandler> = Arc::new(ClosedHandler);
        let handler = std::mem::replace(&mut *self.handler.lock(), handler);
        if catch_unwind(AssertUnwindSafe(|| handler.handle_close(self, &reason))).is_err() {
            error!("Frame handler panicked while closing");
        }
        drop(handler);

        self.close_notifier.close();
        self.terminated.cancel();
    }
}

async fn read_loop<R>(connection: Arc<Connection>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let reason = connection.read_frames(&mut reader).await;
    connection.teardown(reason);
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("closed", &self.is_closed())
            .field("queued_frames", &self.writer.queued_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{build_frame, tags};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    /// Records tags and echoes GREETING frames back.
    #[derive(Default)]
    struct Recorder {
        tags: Mutex<Vec<u8>>,
        closes: AtomicUsize,
        last_reason: Mutex<Option<CloseReason>>,
    }

    impl FrameHandler for Recorder {
        fn handle_frame<'a>(
            &'a self,
            connection: &'a Arc<Connection>,
            frame: Frame,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.tags.lock().push(frame.tag);
                match frame.tag {
                    tags::GREETING => {
                        connection
                            .send(OutboundFrame::new(tags::GREETING, frame.body))
                            .await
                    }
                    tags::AUTH_REJECTED => Err(MuxwireError::UnknownTag(frame.tag)),
                    _ => Ok(()),
                }
            })
        }

        fn handle_close(&self, _connection: &Arc<Connection>, reason: &CloseReason) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            *self.last_reason.lock() = Some(reason.clone());
        }
    }

    fn start(recorder: Arc<Recorder>) -> (Arc<Connection>, tokio::io::DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let connection = Connection::start(
            local,
            Side::Server,
            Arc::new(ConnectionConfig::default()),
            recorder,
        );
        (connection, remote)
    }

    #[tokio::test]
    async fn test_frames_dispatched_in_order() {
        let recorder = Arc::new(Recorder::default());
        let (connection, mut remote) = start(recorder.clone());

        let mut bytes = build_frame(tags::SERVICE_REQUEST, b"a");
        bytes.extend(build_frame(tags::CLIENT_CLOSED, b"b"));
        bytes.extend(build_frame(tags::REQUEST, b"c"));
        remote.write_all(&bytes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *recorder.tags.lock(),
            [tags::SERVICE_REQUEST, tags::CLIENT_CLOSED, tags::REQUEST]
        );
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_handler_can_reply() {
        let recorder = Arc::new(Recorder::default());
        let (_connection, mut remote) = start(recorder);

        remote
            .write_all(&build_frame(tags::GREETING, b"hi"))
            .await
            .unwrap();

        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0, 0, 0, 3, tags::GREETING, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_eof_runs_close_once() {
        let recorder = Arc::new(Recorder::default());
        let (connection, remote) = start(recorder.clone());
        let observed = Arc::new(AtomicUsize::new(0));
        let o = observed.clone();
        connection.add_close_handler(move || {
            o.fetch_add(1, Ordering::SeqCst);
        });

        drop(remote);
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();

        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*recorder.last_reason.lock(), Some(CloseReason::Eof));
        assert_eq!(observed.load(Ordering::SeqCst), 1);
        assert!(matches!(
            connection.send(OutboundFrame::empty(tags::GREETING)).await,
            Err(MuxwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handler_error_closes_connection() {
        let recorder = Arc::new(Recorder::default());
        let (connection, mut remote) = start(recorder.clone());

        remote
            .write_all(&build_frame(tags::AUTH_REJECTED, b""))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();

        assert!(matches!(
            *recorder.last_reason.lock(),
            Some(CloseReason::Protocol(_))
        ));
        // The peer sees EOF once the write half is shut down.
        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_length_closes_connection() {
        let recorder = Arc::new(Recorder::default());
        let (connection, mut remote) = start(recorder.clone());

        remote.write_all(&[0, 0, 0, 0, 0]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), connection.closed())
            .await
            .unwrap();
        assert!(recorder.tags.lock().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_and_handler_swap() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let (connection, mut remote) = start(first.clone());

        connection.set_frame_handler(second.clone());
        remote
            .write_all(&build_frame(tags::REQUEST_ABORT, &[0, 0, 0, 1]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first.tags.lock().is_empty());
        assert_eq!(*second.tags.lock(), [tags::REQUEST_ABORT]);

        connection.close();
        connection.closed().await;
        assert_eq!(first.closes.load(Ordering::SeqCst), 0);
        assert_eq!(second.closes.load(Ordering::SeqCst), 1);
        assert_eq!(*second.last_reason.lock(), Some(CloseReason::Local));
    }

    #[tokio::test]
    async fn test_flush_and_close_delivers_queued_frames() {
        let recorder = Arc::new(Recorder::default());
        let (connection, mut remote) = start(recorder);

        connection
            .send(OutboundFrame::new(tags::AUTH_REJECTED, Bytes::from_static(b"x")))
            .await
            .unwrap();
        connection.flush_and_close().await;

        let mut bytes = Vec::new();
        remote.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, build_frame(tags::AUTH_REJECTED, b"x"));
        connection.closed().await;
    }
}
