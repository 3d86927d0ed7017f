//! Splits a payload into flow-controlled chunk frames.

use std::sync::Arc;

use bytes::Bytes;

use crate::buffer_pool::PooledBuf;
use crate::connection::Connection;
use crate::error::Result;
use crate::flow_control::PermitPool;
use crate::protocol::{flags, ChunkHeader, HEADER_SIZE};
use crate::writer::OutboundFrame;

/// Writes one REQUEST, REPLY or REPLY_EXCEPTION payload as chunks.
///
/// Each chunk body is assembled in a pooled buffer: the chunk header first,
/// then as much data as fits. A chunk is sent only once it is full and more
/// data arrives, or on [`finish`](Self::finish), which sends the LAST chunk.
/// Every chunk costs one permit from the request's pool.
pub(crate) struct ChunkedWriter {
    connection: Arc<Connection>,
    tag: u8,
    id: i32,
    client_id: Option<i32>,
    permits: PermitPool,
    current: Option<PooledBuf>,
    first: bool,
}

impl ChunkedWriter {
    pub fn new(connection: Arc<Connection>, tag: u8, id: i32, permits: PermitPool) -> Self {
        Self {
            connection,
            tag,
            id,
            client_id: None,
            permits,
            current: None,
            first: true,
        }
    }

    /// Carry `client_id` in the first chunk (requests only).
    pub fn with_client(mut self, client_id: i32) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Write all of `data`, then the LAST chunk.
    pub async fn send_all(mut self, data: &[u8]) -> Result<()> {
        self.write(data).await?;
        self.finish().await
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let capacity = self.chunk_capacity();
        while !data.is_empty() {
            if self.current.as_ref().is_some_and(|buf| buf.len() >= capacity) {
                self.flush(false).await?;
            }
            let buf = match self.current.take() {
                Some(buf) => buf,
                None => self.start_chunk(),
            };
            let buf = self.current.insert(buf);
            let n = (capacity - buf.len()).min(data.len());
            buf.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
        Ok(())
    }

    /// Send whatever is buffered as the LAST chunk.
    pub async fn finish(mut self) -> Result<()> {
        self.flush(true).await
    }

    fn header(&self, last: bool) -> ChunkHeader {
        let mut chunk_flags = 0;
        if self.first {
            chunk_flags |= flags::FIRST;
        }
        if last {
            chunk_flags |= flags::LAST;
        }
        ChunkHeader {
            id: self.id,
            flags: chunk_flags,
            client_id: if self.first { self.client_id } else { None },
        }
    }

    fn start_chunk(&self) -> PooledBuf {
        let mut buf = self.connection.buffer_pool().get();
        buf.resize(self.header(false).encoded_len(), 0);
        buf
    }

    /// Body bytes per chunk, chunk header included.
    fn chunk_capacity(&self) -> usize {
        self.connection.buffer_pool().buffer_size() - HEADER_SIZE
    }

    async fn flush(&mut self, last: bool) -> Result<()> {
        let mut buf = match self.current.take() {
            Some(buf) => buf,
            None => self.start_chunk(),
        };
        let header = self.header(last);
        header.encode_into(&mut buf[..header.encoded_len()]);

        self.permits.acquire().await?;
        self.connection
            .send(OutboundFrame::new(self.tag, buf.freeze()))
            .await?;
        self.first = false;
        Ok(())
    }
}

/// Body of a single FIRST|LAST chunk carrying all of `data`.
///
/// `None` if the chunk would not fit a `buffer_size` frame. Used for
/// answers that have no flow-control window to draw on.
pub(crate) fn single_chunk(id: i32, data: &[u8], buffer_size: usize) -> Option<Bytes> {
    let header = ChunkHeader::new(id, flags::FIRST | flags::LAST);
    let len = header.encoded_len() + data.len();
    if HEADER_SIZE + len > buffer_size {
        return None;
    }
    let mut body = vec![0u8; len];
    header.encode_into(&mut body);
    body[header.encoded_len()..].copy_from_slice(data);
    Some(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, Side};
    use crate::connection::{CloseReason, FrameHandler};
    use crate::handler::BoxFuture;
    use crate::protocol::{tags, Frame};
    use crate::error::MuxwireError;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    const BUFFER_SIZE: usize = 64;

    struct Discard;

    impl FrameHandler for Discard {
        fn handle_frame<'a>(
            &'a self,
            _connection: &'a Arc<Connection>,
            _frame: Frame,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn handle_close(&self, _connection: &Arc<Connection>, _reason: &CloseReason) {}
    }

    fn start() -> (Arc<Connection>, DuplexStream) {
        let (local, remote) = duplex(64 * 1024);
        let config = ConnectionConfig {
            buffer_size: BUFFER_SIZE,
            ..Default::default()
        };
        let connection =
            Connection::start(local, Side::Client, Arc::new(config), Arc::new(Discard));
        (connection, remote)
    }

    /// Read one frame, returning its wire size alongside it.
    async fn read_frame(stream: &mut DuplexStream) -> (usize, Frame) {
        let mut header = [0u8; HEADER_SIZE];
        stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut body = vec![0u8; len - 1];
        stream.read_exact(&mut body).await.unwrap();
        (HEADER_SIZE + body.len(), Frame::new(header[4], Bytes::from(body)))
    }

    async fn nothing_arrives(stream: &mut DuplexStream) {
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut byte)).await;
        assert!(read.is_err(), "unexpected frame without a permit");
    }

    #[tokio::test]
    async fn test_window_stops_unacknowledged_chunks() {
        let (connection, mut remote) = start();
        let permits = PermitPool::new(5);
        let writer = ChunkedWriter::new(connection, tags::REPLY, 9, permits.clone());
        let payload = vec![7u8; BUFFER_SIZE * 8];
        let task = tokio::spawn(async move { writer.send_all(&payload).await });

        for _ in 0..5 {
            let (_, frame) = read_frame(&mut remote).await;
            assert_eq!(frame.tag, tags::REPLY);
        }
        nothing_arrives(&mut remote).await;
        assert_eq!(permits.in_flight(), 5);

        permits.release();
        read_frame(&mut remote).await;
        nothing_arrives(&mut remote).await;
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_chunks_fit_buffer_and_flag_ends() {
        let (connection, mut remote) = start();
        let permits = PermitPool::new(64);
        let payload: Vec<u8> = (0..BUFFER_SIZE * 3).map(|i| i as u8).collect();
        ChunkedWriter::new(connection, tags::REQUEST, 4, permits.clone())
            .with_client(11)
            .send_all(&payload)
            .await
            .unwrap();

        let mut data = Vec::new();
        let mut chunks = 0;
        loop {
            let (size, frame) = read_frame(&mut remote).await;
            assert!(size <= BUFFER_SIZE, "frame of {} bytes", size);
            let (header, body) = ChunkHeader::decode(frame.tag, frame.body).unwrap();
            assert_eq!(header.id, 4);
            assert_eq!(header.is_first(), chunks == 0);
            assert_eq!(header.client_id, (chunks == 0).then_some(11));
            data.extend_from_slice(&body);
            chunks += 1;
            if header.is_last() {
                break;
            }
        }
        assert_eq!(data, payload);
        assert!(chunks > 3);
        assert_eq!(permits.in_flight(), chunks);
    }

    #[tokio::test]
    async fn test_last_chunk_takes_permit() {
        let (connection, mut remote) = start();
        let permits = PermitPool::new(5);
        ChunkedWriter::new(connection, tags::REPLY_EXCEPTION, 2, permits.clone())
            .send_all(b"small")
            .await
            .unwrap();

        let (_, frame) = read_frame(&mut remote).await;
        let (header, body) = ChunkHeader::decode(frame.tag, frame.body).unwrap();
        assert!(header.is_first() && header.is_last());
        assert_eq!(&body[..], b"small");
        assert_eq!(permits.available(), 4);
    }

    #[tokio::test]
    async fn test_closed_pool_interrupts_writer() {
        let (connection, _remote) = start();
        let permits = PermitPool::new(1);
        let writer = ChunkedWriter::new(connection, tags::REPLY, 3, permits.clone());
        let payload = vec![0u8; BUFFER_SIZE * 4];
        let task = tokio::spawn(async move { writer.send_all(&payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        permits.close();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(MuxwireError::Interrupted(_))));
    }

    #[test]
    fn test_single_chunk_fits_or_refuses() {
        let body = single_chunk(6, b"closed", BUFFER_SIZE).unwrap();
        let (header, data) = ChunkHeader::decode(tags::REPLY_EXCEPTION, body).unwrap();
        assert_eq!(header.id, 6);
        assert!(header.is_first() && header.is_last());
        assert_eq!(&data[..], b"closed");

        let fits = vec![0u8; BUFFER_SIZE - HEADER_SIZE - 5];
        assert!(single_chunk(6, &fits, BUFFER_SIZE).is_some());
        let too_long = vec![0u8; fits.len() + 1];
        assert!(single_chunk(6, &too_long, BUFFER_SIZE).is_none());
    }
}
