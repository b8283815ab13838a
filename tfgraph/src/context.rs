//! Cancellation context threaded through walks and provider calls
//!
//! A `Context` carries the cooperative stop signal. It is passed as the
//! first parameter to every provider operation and every hook, and the walk
//! executor checks it before dispatching each vertex.

use std::sync::Arc;
use tokio::sync::watch;

/// Cooperative cancellation token. Cloning shares the underlying signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    done: watch::Receiver<bool>,
    done_tx: watch::Sender<bool>,
}

impl Context {
    pub fn new() -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            inner: Arc::new(ContextInner {
                done: done_rx,
                done_tx,
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Returns a channel that flips to `true` when work done on behalf of
    /// this context should stop.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.done.clone()
    }

    pub fn cancel(&self) {
        let _ = self.inner.done_tx.send(true);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
