//! Serial queue for events whose global order matters
//!
//! Lock, memory and GPU events are appended under one mutex so the order the
//! worker sees matches the order in which threads took the lock. The worker
//! swaps the whole buffer out and processes it with the lock released.
//!
//! ```text
//!  producers ── lock ─▶ [ pending Vec ] ◀─ swap ─▶ [ worker Vec ] ── encode
//! ```

use parking_lot::{Mutex, MutexGuard};

pub struct SerialQueue<T> {
    pending: Mutex<Vec<T>>,
}

impl<T> SerialQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { pending: Mutex::new(Vec::new()) }
    }

    /// Take the queue lock
    ///
    /// Everything pushed through one guard stays contiguous, e.g. an
    /// allocation followed by its callstack.
    pub fn lock(&self) -> SerialGuard<'_, T> {
        SerialGuard { pending: self.pending.lock() }
    }

    /// Append a single item
    pub fn push(&self, item: T) {
        self.pending.lock().push(item);
    }

    /// Exchange the pending buffer with `out`
    ///
    /// `out` should be empty; whatever it held becomes the new pending buffer.
    pub fn swap(&self, out: &mut Vec<T>) {
        debug_assert!(out.is_empty(), "worker buffer not drained before swap");
        std::mem::swap(&mut *self.pending.lock(), out);
    }

    /// Drop every pending item
    pub fn clear(&self) -> usize {
        let detached = std::mem::take(&mut *self.pending.lock());
        let n = detached.len();
        drop(detached);
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<T> Default for SerialQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive append access to a [`SerialQueue`]
pub struct SerialGuard<'a, T> {
    pending: MutexGuard<'a, Vec<T>>,
}

impl<T> SerialGuard<'_, T> {
    pub fn push(&mut self, item: T) {
        self.pending.push(item);
    }
}
