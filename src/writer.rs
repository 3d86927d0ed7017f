//! Dedicated writer task for outgoing frames.
//!
//! Every producer on a connection (the demux path, request executions,
//! unmarshalling threads acknowledging chunks) hands frames to one writer
//! task through an mpsc channel. The task batches whatever is ready into a
//! single vectored write.
//!
//! # Architecture
//!
//! ```text
//! Read loop   ─┐
//! Executions  ─┼─► mpsc::Sender<WriterMessage> ─► Writer Task ─► byte channel
//! Unmarshal   ─┘
//! ```
//!
//! A full channel makes `send` wait, which is the connection-level
//! backpressure. The task stops when the shutdown token is cancelled or a
//! [`WriterMessage::Shutdown`] marker is reached; either way it shuts the
//! write half down and cancels the token so the read loop follows.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{MuxwireError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Upper bound on frames gathered into one vectored write.
const MAX_FRAMES_PER_WRITE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded length prefix and tag.
    pub header: [u8; HEADER_SIZE],
    pub body: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(tag: u8, body: Bytes) -> Self {
        Self {
            header: Header::new(tag, body.len()).encode(),
            body,
        }
    }

    #[inline]
    pub fn empty(tag: u8) -> Self {
        Self::new(tag, Bytes::new())
    }

    #[inline]
    pub fn tag(&self) -> u8 {
        self.header[HEADER_SIZE - 1]
    }

    /// Bytes this frame occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    fn parts(&self) -> [&[u8]; 2] {
        [&self.header, &self.body]
    }
}

/// Items consumed by the writer task.
#[derive(Debug)]
pub enum WriterMessage {
    Frame(OutboundFrame),
    /// Write everything queued before this marker, then shut down.
    Shutdown,
}

/// Sending side of a connection's writer task.
///
/// Cheaply cloneable; every clone feeds the same task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterMessage>,
    queued: Arc<AtomicUsize>,
    runtime: Handle,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(WriterMessage::Frame(frame)).await.is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(MuxwireError::ConnectionClosed);
        }
        Ok(())
    }

    /// Queue a frame from a context that cannot await.
    ///
    /// If the channel is full the send continues on a runtime task. Frames
    /// sent this way may overtake frames queued later through the slow path,
    /// so it is only used for frames whose relative order does not matter.
    pub fn send_detached(&self, frame: OutboundFrame) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        let message = match self.tx.try_send(WriterMessage::Frame(frame)) {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(message)) => message,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                trace!("Dropping frame for closed writer");
                return;
            }
        };
        let tx = self.tx.clone();
        let queued = self.queued.clone();
        self.runtime.spawn(async move {
            if tx.send(message).await.is_err() {
                queued.fetch_sub(1, Ordering::AcqRel);
            }
        });
    }

    /// Ask the writer to flush everything queued so far and shut down.
    pub async fn request_shutdown(&self) {
        // An error means the writer already stopped.
        let _ = self.tx.send(WriterMessage::Shutdown).await;
    }

    /// Frames handed over but not yet written.
    #[inline]
    pub fn queued_frames(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start the writer task for `sink`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_writer_task<W>(
    sink: W,
    channel_capacity: usize,
    shutdown: CancellationToken,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(channel_capacity.max(1));
    let queued = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle {
        tx,
        queued: queued.clone(),
        runtime: Handle::current(),
    };
    let task = tokio::spawn(run_writer(rx, sink, queued, shutdown));
    (handle, task)
}

async fn run_writer<W>(
    mut rx: mpsc::Receiver<WriterMessage>,
    mut sink: W,
    queued: Arc<AtomicUsize>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = drain(&mut rx, &mut sink, &queued, &shutdown).await;
    match &result {
        Ok(()) => debug!("Writer task stopping"),
        Err(e) => error!(error = %e, "Writer failed"),
    }
    rx.close();
    // The peer may already be gone; nothing useful to report then.
    let _ = sink.shutdown().await;
    shutdown.cancel();
    result
}

async fn drain<W>(
    rx: &mut mpsc::Receiver<WriterMessage>,
    sink: &mut W,
    queued: &AtomicUsize,
    shutdown: &CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frames = Vec::with_capacity(MAX_FRAMES_PER_WRITE);
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            next = rx.recv() => next,
        };
        let Some(first) = next else {
            return Ok(());
        };

        frames.clear();
        let stop = gather(first, rx, &mut frames);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            written = write_frames(sink, &frames) => written?,
        }
        queued.fetch_sub(frames.len(), Ordering::AcqRel);

        if stop {
            return Ok(());
        }
    }
}

/// Collect `first` plus whatever is already queued into `frames`.
///
/// Returns `true` once a shutdown marker was taken off the channel.
fn gather(
    first: WriterMessage,
    rx: &mut mpsc::Receiver<WriterMessage>,
    frames: &mut Vec<OutboundFrame>,
) -> bool {
    let mut next = Some(first);
    while let Some(message) = next.take() {
        match message {
            WriterMessage::Frame(frame) => frames.push(frame),
            WriterMessage::Shutdown => return true,
        }
        if frames.len() < MAX_FRAMES_PER_WRITE {
            next = rx.try_recv().ok();
        }
    }
    false
}

/// Write `frames` back to back with `write_vectored`, then flush.
async fn write_frames<W>(sink: &mut W, frames: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = frames.iter().map(OutboundFrame::size).sum();
    let mut written = 0;
    while written < total {
        let slices = unwritten_slices(frames, written);
        match sink.write_vectored(&slices).await? {
            0 => return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into()),
            n => written += n,
        }
    }
    sink.flush().await?;
    Ok(())
}

/// Slices covering everything past the first `skip` bytes of `frames`.
fn unwritten_slices(frames: &[OutboundFrame], mut skip: usize) -> Vec<IoSlice<'_>> {
    frames
        .iter()
        .flat_map(OutboundFrame::parts)
        .filter_map(|part| {
            if skip >= part.len() {
                skip -= part.len();
                return None;
            }
            let rest = &part[skip..];
            skip = 0;
            Some(IoSlice::new(rest))
        })
        .collect()
}
