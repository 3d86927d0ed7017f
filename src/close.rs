//! One-shot close notification.
//!
//! A [`CloseNotifier`] collects close observers and runs each of them exactly
//! once when the owner closes. Observers added after close run immediately.

use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::error;

type CloseHandler = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    closed: bool,
    handlers: Vec<CloseHandler>,
}

/// Runs registered handlers once on close.
#[derive(Default)]
pub struct CloseNotifier {
    inner: Mutex<Inner>,
}

impl CloseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// Runs on the calling thread right away if already closed.
    pub fn add_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut inner = self.inner.lock();
            if !inner.closed {
                inner.handlers.push(Box::new(handler));
                return;
            }
        }
        run_handler(Box::new(handler));
    }

    /// Mark closed and run every handler.
    ///
    /// Returns `true` only for the call that performed the close.
    pub fn close(&self) -> bool {
        let handlers = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            std::mem::take(&mut inner.handlers)
        };
        for handler in handlers {
            run_handler(handler);
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl std::fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CloseNotifier")
            .field("closed", &inner.closed)
            .field("handlers", &inner.handlers.len())
            .finish()
    }
}

fn run_handler(handler: CloseHandler) {
    if catch_unwind(AssertUnwindSafe(handler)).is_err() {
        error!("Close handler panicked");
    }
}
