//! Replay log for events every collector must see
//!
//! In on-demand mode nothing is sent before a collector attaches, and the
//! queues are cleared while nobody is listening. Some facts (application
//! info, plot formats, lock and GPU context announcements) would be lost that
//! way, so a copy of each is kept here and replayed at the start of every
//! session, ahead of live data.
//!
//! The log and the connection epoch share one lock:
//!
//! ```text
//!  producer                         worker (session start)
//!  ────────                         ──────────────────────
//!  lock                             lock
//!    append copy                      epoch += 1
//!    epoch_seen = epoch               replay log ──▶ frame
//!  unlock                           unlock
//!  enqueue live copy (epoch_seen)
//! ```
//!
//! A live copy stamped before the bump is stale and dropped; the replay
//! already carries it. One stamped after the bump is delivered live, and the
//! replay did not include it. Either way the collector sees it once.
//!
//! A lock's termination removes that lock's entries instead of being logged,
//! so later collectors never hear of it and the log stays as large as the
//! set of live locks.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use zonetrace_common::RecordType;

use crate::domain::{Epoch, ThreadId};
use crate::event::Event;

/// Whether an event kind survives periods without a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Dropped when no collector is attached
    Transient,
    /// Kept in the replay log and sent to every collector
    Deferred,
}

/// Retention policy per record kind
#[must_use]
pub fn retention(kind: RecordType) -> Retention {
    match kind {
        RecordType::MessageAppInfo
        | RecordType::PlotConfig
        | RecordType::ParamSetup
        | RecordType::LockAnnounce
        | RecordType::LockTerminate
        | RecordType::LockName
        | RecordType::GpuNewContext
        | RecordType::GpuContextName => Retention::Deferred,
        _ => Retention::Transient,
    }
}

struct Entry {
    thread: ThreadId,
    event: Event,
}

/// Lock the event is about, for the kinds a termination cancels
fn lock_id(event: &Event) -> Option<u32> {
    match event {
        Event::LockAnnounce { id, .. } | Event::LockName { id, .. } | Event::LockTerminate { id, .. } => Some(*id),
        _ => None,
    }
}

pub struct DeferredQueue {
    log: Mutex<Vec<Entry>>,
    /// Written only under `log`'s lock; read lock-free by producers
    epoch: AtomicU32,
}

impl DeferredQueue {
    #[must_use]
    pub fn new() -> Self {
        Self { log: Mutex::new(Vec::new()), epoch: AtomicU32::new(0) }
    }

    /// Current connection epoch
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    /// Append `event` to the log and return the epoch to stamp the live copy with
    ///
    /// A `LockTerminate` is not appended; it drops the entries of its lock.
    pub fn defer(&self, thread: ThreadId, event: Event) -> Epoch {
        debug_assert_eq!(retention(event.kind()), Retention::Deferred);
        let mut log = self.log.lock();
        if let Event::LockTerminate { id, .. } = event {
            log.retain(|entry| lock_id(&entry.event) != Some(id));
        } else {
            log.push(Entry { thread, event });
        }
        Epoch(self.epoch.load(Ordering::Relaxed))
    }

    /// Bump the epoch and hand every logged event to `f`, atomically
    /// with respect to [`DeferredQueue::defer`]
    ///
    /// Returns the new epoch.
    pub fn bump_and_replay(&self, mut f: impl FnMut(ThreadId, &Event)) -> Epoch {
        let log = self.log.lock();
        let epoch = self.epoch.load(Ordering::Relaxed).wrapping_add(1);
        self.epoch.store(epoch, Ordering::Release);
        for entry in log.iter() {
            f(entry.thread, &entry.event);
        }
        Epoch(epoch)
    }

    /// Bump the epoch without replaying, e.g. on disconnect
    pub fn bump(&self) -> Epoch {
        let _log = self.log.lock();
        let epoch = self.epoch.load(Ordering::Relaxed).wrapping_add(1);
        self.epoch.store(epoch, Ordering::Release);
        Epoch(epoch)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}
