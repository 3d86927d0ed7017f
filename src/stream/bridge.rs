//! Blocking byte input fed by chunk frames.
//!
//! [`ByteInputBridge`] is the producer half, called from the demux path.
//! [`BridgeReader`] is the consumer half, a `std::io::Read` handed to an
//! unmarshaller running on a blocking thread.
//!
//! Every chunk pushed with [`ByteInputBridge::push`] is acknowledged once the
//! reader has consumed all of its bytes. Chunks discarded by a fault are
//! acknowledged at the moment of the fault so the remote producer never
//! waits on permits for data nobody will read.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};

use super::StreamFault;

/// Callback run once per acknowledged chunk.
pub type AckFn = Arc<dyn Fn() + Send + Sync>;

struct Pending {
    data: Bytes,
    ack: bool,
}

#[derive(Default)]
struct State {
    chunks: VecDeque<Pending>,
    eof: bool,
    fault: Option<StreamFault>,
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
    ack: AckFn,
}

impl Shared {
    fn ack_n(&self, n: usize) {
        for _ in 0..n {
            (self.ack)();
        }
    }
}

/// Producer half.
#[derive(Clone)]
pub struct ByteInputBridge {
    shared: Arc<Shared>,
}

/// Consumer half.
pub struct BridgeReader {
    shared: Arc<Shared>,
}

/// Create a connected bridge pair.
pub fn bridge(ack: AckFn) -> (ByteInputBridge, BridgeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::default()),
        ready: Condvar::new(),
        ack,
    });
    (
        ByteInputBridge {
            shared: shared.clone(),
        },
        BridgeReader { shared },
    )
}

impl ByteInputBridge {
    /// Queue a chunk that is acknowledged once read.
    pub fn push(&self, data: Bytes) {
        self.enqueue(data, true, false);
    }

    /// Queue the final chunk and end the input. Not acknowledged.
    pub fn push_last(&self, data: Bytes) {
        self.enqueue(data, false, true);
    }

    /// End the input.
    pub fn push_eof(&self) {
        self.enqueue(Bytes::new(), false, true);
    }

    /// Fail the input. Buffered chunks are dropped and acknowledged.
    pub fn push_exception(&self, fault: StreamFault) {
        let dropped = {
            let mut state = self.shared.state.lock();
            if state.fault.is_some() {
                return;
            }
            state.fault = Some(fault);
            let dropped = state.chunks.drain(..).filter(|c| c.ack).count();
            self.shared.ready.notify_all();
            dropped
        };
        self.shared.ack_n(dropped);
    }

    fn enqueue(&self, data: Bytes, ack: bool, eof: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.fault.is_none() && !state.eof {
                state.chunks.push_back(Pending { data, ack });
                state.eof = eof;
                self.shared.ready.notify_all();
                return;
            }
        }
        // Nobody will read this chunk; release the sender anyway.
        if ack {
            (self.shared.ack)();
        }
    }
}

impl BridgeReader {
    /// The fault that ended the input, if any.
    pub fn fault(&self) -> Option<StreamFault> {
        self.shared.state.lock().fault
    }

    /// Read and discard everything up to end of input or a fault.
    ///
    /// Blocks the calling thread.
    pub fn drain(&mut self) {
        let mut scratch = [0u8; 1024];
        while let Ok(n) = self.read(&mut scratch) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Read for BridgeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut acks = 0;
        let result = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(fault) = state.fault {
                    break Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        fault.to_string(),
                    ));
                }
                // Step over exhausted chunks, acknowledging as we go.
                while state.chunks.front().is_some_and(|c| c.data.is_empty()) {
                    if let Some(chunk) = state.chunks.pop_front() {
                        if chunk.ack {
                            acks += 1;
                        }
                    }
                }
                if buf.is_empty() {
                    break Ok(0);
                }
                if let Some(front) = state.chunks.front_mut() {
                    let n = front.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&front.data[..n]);
                    front.data.advance(n);
                    if front.data.is_empty() {
                        if let Some(chunk) = state.chunks.pop_front() {
                            if chunk.ack {
                                acks += 1;
                            }
                        }
                    }
                    break Ok(n);
                }
                if state.eof {
                    break Ok(0);
                }
                self.shared.ready.wait(&mut state);
            }
        };
        self.shared.ack_n(acks);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn counting() -> (AckFn, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let ack: AckFn = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (ack, count)
    }

    #[test]
    fn test_read_across_chunks() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push(Bytes::from_static(b"hel"));
        producer.push(Bytes::from_static(b"lo "));
        producer.push_last(Bytes::from_static(b"world"));

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
        // The last chunk is not acknowledged.
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_ack_only_after_chunk_fully_read() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push(Bytes::from_static(b"abcd"));

        let mut buf = [0u8; 3];
        assert_eq!(reader.read(&mut buf).unwrap(), 3);
        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_chunk_acknowledged_when_passed() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push(Bytes::new());
        producer.push_eof();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reader_blocks_until_data() {
        let (ack, _) = counting();
        let (producer, mut reader) = bridge(ack);

        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });
        thread::sleep(Duration::from_millis(20));
        producer.push(Bytes::from_static(b"late"));
        producer.push_eof();

        assert_eq!(handle.join().unwrap(), b"late");
    }

    #[test]
    fn test_fault_wins_over_buffered_data() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push(Bytes::from_static(b"one"));
        producer.push(Bytes::from_static(b"two"));
        producer.push_exception(StreamFault::Interrupted);

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert_eq!(reader.fault(), Some(StreamFault::Interrupted));
        // Dropped chunks were released.
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_push_after_end_is_acknowledged_and_dropped() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push_eof();
        producer.push(Bytes::from_static(b"stray"));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(acks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drain_consumes_rest() {
        let (ack, acks) = counting();
        let (producer, mut reader) = bridge(ack);
        producer.push(Bytes::from(vec![1u8; 3000]));
        producer.push(Bytes::from(vec![2u8; 10]));
        producer.push_eof();

        let mut first = [0u8; 1];
        reader.read_exact(&mut first).unwrap();
        reader.drain();
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }
}
