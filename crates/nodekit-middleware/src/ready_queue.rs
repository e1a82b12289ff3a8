//! FIFO of callbacks waiting for the next dispatch tick.
//!
//! Transport-side code never calls user handlers directly.  It pushes a
//! closure here and the owning node runs the whole batch from
//! [`MiddlewareNode::spin_once`][crate::MiddlewareNode::spin_once].  Callbacks
//! run in the order they were pushed.

use std::collections::VecDeque;

use parking_lot::Mutex;

type ReadyCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct ReadyQueue {
    pending: Mutex<VecDeque<ReadyCallback>>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `callback` for the next drain.
    pub fn push(&self, callback: impl FnOnce() + Send + 'static) {
        self.pending.lock().push_back(Box::new(callback));
    }

    /// Run every callback queued before this call.
    ///
    /// The lock is released before any callback runs, so callbacks may push
    /// further work; that work waits for the following drain.
    pub fn drain(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let ran = batch.len();
        for callback in batch {
            callback();
        }
        ran
    }

    /// Drop every queued callback without running it.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
