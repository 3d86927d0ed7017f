//! Per-request chunk flow control.
//!
//! Every chunk a request sends consumes one permit from a small window
//! (five by default). The peer returns permits with `*_ACK_CHUNK` frames
//! once its consumer has read the chunk. A producer that runs out of
//! permits waits; closing the pool wakes every waiter with an error, which
//! is how cancellation and teardown interrupt a blocked producer.
//!
//! Releases are capped at the window: a stray or duplicate ACK never grows
//! the window past its configured size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::{MuxwireError, Result};

/// Default number of unacknowledged chunks per request.
pub const DEFAULT_WINDOW: usize = 5;

/// Counting pool of chunk permits.
///
/// Cheap to clone; clones share the same window.
#[derive(Debug, Clone)]
pub struct PermitPool {
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    window: usize,
}

impl PermitPool {
    /// Create a pool with `window` permits available.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(window)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            window,
        }
    }

    /// Take one permit, waiting until one is available.
    ///
    /// Fails with `Interrupted` once the pool is closed.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MuxwireError::Interrupted("flow control closed".to_string()))?;
        permit.forget();
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Take one permit without waiting.
    ///
    /// Returns `false` if the window is exhausted or the pool is closed.
    pub fn try_acquire(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.in_flight.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => false,
        }
    }

    /// Return one permit, as signalled by a peer ACK.
    ///
    /// An ACK with nothing in flight is logged and ignored.
    pub fn release(&self) {
        let released = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if released {
            self.semaphore.add_permits(1);
        } else {
            warn!(window = self.window, "ACK beyond flow-control window ignored");
        }
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Chunks sent but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Configured window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Close the pool, failing current and future acquires.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Default for PermitPool {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sixth_acquire_waits_for_ack() {
        let pool = PermitPool::default();
        for _ in 0..5 {
            pool.acquire().await.unwrap();
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 5);

        let waiter = pool.clone();
        let sixth = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sixth.is_finished());

        pool.release();
        tokio::time::timeout(Duration::from_secs(1), sixth)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pool.in_flight(), 5);
    }

    #[tokio::test]
    async fn test_one_ack_unblocks_exactly_one() {
        let pool = PermitPool::new(1);
        pool.acquire().await.unwrap();

        let a = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        let b = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let finished = [a.is_finished(), b.is_finished()];
        assert_eq!(finished.iter().filter(|f| **f).count(), 1);

        pool.close();
        let _ = a.await;
        let _ = b.await;
    }

    #[test]
    fn test_release_beyond_window_ignored() {
        let pool = PermitPool::new(2);
        pool.release();
        pool.release();
        assert_eq!(pool.available(), 2);

        assert!(pool.try_acquire());
        pool.release();
        pool.release();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_close_interrupts_waiter() {
        let pool = PermitPool::new(1);
        pool.acquire().await.unwrap();

        let waiter = pool.clone();
        let blocked = tokio::spawn(async move { waiter.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.close();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(MuxwireError::Interrupted(_))));
        assert!(pool.is_closed());
        assert!(!pool.try_acquire());
    }
}
