//! Lock wrappers that report contention
//!
//! Each wrapper announces itself once, then reports wait, obtain and release
//! for every acquisition through the serial queue, so the collector sees the
//! same order in which threads actually took the lock.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{current, Profiler};
use crate::clock;
use crate::domain::ThreadId;
use crate::event::{Event, Payload, SourceLocation};

static NEXT_LOCK_ID: AtomicU32 = AtomicU32::new(1);

/// Identity and profiler binding shared by both wrappers
#[derive(Debug)]
struct LockSite {
    id: u32,
    profiler: Option<Arc<Profiler>>,
}

impl LockSite {
    fn new(profiler: Option<Arc<Profiler>>, srcloc: &'static SourceLocation, shared: bool) -> Self {
        let id = NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = &profiler {
            let time = clock::now();
            p.submit_deferred(|| Event::LockAnnounce { id, time, srcloc, shared });
        }
        Self { id, profiler }
    }

    fn report(&self, make: impl FnOnce(u32, u32, i64) -> Event) {
        if let Some(p) = &self.profiler {
            p.submit(|| make(ThreadId::current().0, self.id, clock::now()));
        }
    }

    fn mark(&self, srcloc: &'static SourceLocation) {
        if let Some(p) = &self.profiler {
            let id = self.id;
            p.submit(|| Event::LockMark { thread: ThreadId::current().0, id, srcloc });
        }
    }

    fn set_name(&self, name: &str) {
        if let Some(p) = &self.profiler {
            let id = self.id;
            p.submit_deferred(|| Event::LockName { id, name: Payload::from(name) });
        }
    }
}

impl Drop for LockSite {
    fn drop(&mut self) {
        if let Some(p) = &self.profiler {
            let (id, time) = (self.id, clock::now());
            p.submit_deferred(|| Event::LockTerminate { id, time });
        }
    }
}

/// [`parking_lot::Mutex`] that reports its contention
#[derive(Debug)]
pub struct TracedMutex<T> {
    inner: Mutex<T>,
    site: LockSite,
}

impl<T> TracedMutex<T> {
    /// Wrap `value`, reporting to the process-wide profiler if one runs
    pub fn new(value: T, srcloc: &'static SourceLocation) -> Self {
        Self::with_profiler(value, srcloc, current())
    }

    pub fn with_profiler(value: T, srcloc: &'static SourceLocation, profiler: Option<Arc<Profiler>>) -> Self {
        Self { inner: Mutex::new(value), site: LockSite::new(profiler, srcloc, false) }
    }

    pub fn lock(&self) -> TracedMutexGuard<'_, T> {
        self.site.report(|thread, id, time| Event::LockWait { thread, id, time });
        let guard = self.inner.lock();
        self.site.report(|thread, id, time| Event::LockObtain { thread, id, time });
        TracedMutexGuard { guard: ManuallyDrop::new(guard), site: &self.site }
    }

    /// Acquire without waiting; no wait is reported
    pub fn try_lock(&self) -> Option<TracedMutexGuard<'_, T>> {
        let guard = self.inner.try_lock()?;
        self.site.report(|thread, id, time| Event::LockObtain { thread, id, time });
        Some(TracedMutexGuard { guard: ManuallyDrop::new(guard), site: &self.site })
    }

    /// Record where the lock is being used from
    pub fn mark(&self, srcloc: &'static SourceLocation) {
        self.site.mark(srcloc);
    }

    pub fn set_name(&self, name: &str) {
        self.site.set_name(name);
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.site.id
    }
}

pub struct TracedMutexGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    site: &'a LockSite,
}

impl<T> Deref for TracedMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TracedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TracedMutexGuard<'_, T> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here, and never touched again
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.site.report(|thread, id, time| Event::LockRelease { thread, id, time });
    }
}

/// [`parking_lot::RwLock`] that reports its contention
#[derive(Debug)]
pub struct TracedRwLock<T> {
    inner: RwLock<T>,
    site: LockSite,
}

impl<T> TracedRwLock<T> {
    pub fn new(value: T, srcloc: &'static SourceLocation) -> Self {
        Self::with_profiler(value, srcloc, current())
    }

    pub fn with_profiler(value: T, srcloc: &'static SourceLocation, profiler: Option<Arc<Profiler>>) -> Self {
        Self { inner: RwLock::new(value), site: LockSite::new(profiler, srcloc, true) }
    }

    pub fn read(&self) -> TracedRwLockReadGuard<'_, T> {
        self.site.report(|thread, id, time| Event::LockSharedWait { thread, id, time });
        let guard = self.inner.read();
        self.site.report(|thread, id, time| Event::LockSharedObtain { thread, id, time });
        TracedRwLockReadGuard { guard: ManuallyDrop::new(guard), site: &self.site }
    }

    pub fn write(&self) -> TracedRwLockWriteGuard<'_, T> {
        self.site.report(|thread, id, time| Event::LockWait { thread, id, time });
        let guard = self.inner.write();
        self.site.report(|thread, id, time| Event::LockObtain { thread, id, time });
        TracedRwLockWriteGuard { guard: ManuallyDrop::new(guard), site: &self.site }
    }

    pub fn mark(&self, srcloc: &'static SourceLocation) {
        self.site.mark(srcloc);
    }

    pub fn set_name(&self, name: &str) {
        self.site.set_name(name);
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.site.id
    }
}

pub struct TracedRwLockReadGuard<'a, T> {
    guard: ManuallyDrop<RwLockReadGuard<'a, T>>,
    site: &'a LockSite,
}

impl<T> Deref for TracedRwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for TracedRwLockReadGuard<'_, T> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here, and never touched again
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.site.report(|thread, id, time| Event::LockSharedRelease { thread, id, time });
    }
}

pub struct TracedRwLockWriteGuard<'a, T> {
    guard: ManuallyDrop<RwLockWriteGuard<'a, T>>,
    site: &'a LockSite,
}

impl<T> Deref for TracedRwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for TracedRwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for TracedRwLockWriteGuard<'_, T> {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here, and never touched again
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.site.report(|thread, id, time| Event::LockRelease { thread, id, time });
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::idle_profiler;
    use super::*;
    use crate::config::Config;
    use crate::event::QueueItem;

    static SITE: SourceLocation =
        SourceLocation { name: Some("cache"), function: "lock::tests", file: "lock.rs", line: 1, color: 0 };

    fn serial_events(profiler: &Profiler) -> Vec<Event> {
        let mut batch: Vec<QueueItem> = Vec::new();
        profiler.shared.serial.swap(&mut batch);
        batch.into_iter().map(|item| item.event).collect()
    }

    #[test]
    fn test_untraced_mutex_behaves_like_a_mutex() {
        let lock = TracedMutex::with_profiler(1, &SITE, None);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
        let held = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(held);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_mutex_reports_announce_wait_obtain_release() {
        let profiler = idle_profiler(Config::local_ephemeral());
        let lock = TracedMutex::with_profiler(Vec::<u32>::new(), &SITE, Some(Arc::clone(&profiler)));
        lock.lock().push(1);
        lock.set_name("work list");
        let id = lock.id();
        drop(lock);

        let events = serial_events(&profiler);
        assert!(matches!(events[0], Event::LockAnnounce { id: i, shared: false, .. } if i == id));
        assert!(matches!(events[1], Event::LockWait { id: i, .. } if i == id));
        assert!(matches!(events[2], Event::LockObtain { .. }));
        assert!(matches!(events[3], Event::LockRelease { .. }));
        assert!(matches!(events[4], Event::LockName { .. }));
        assert!(matches!(events[5], Event::LockTerminate { .. }));
        profiler.shutdown();
    }

    #[test]
    fn test_rwlock_reports_shared_and_exclusive() {
        let profiler = idle_profiler(Config::local_ephemeral());
        let lock = TracedRwLock::with_profiler(0u64, &SITE, Some(Arc::clone(&profiler)));
        {
            let a = lock.read();
            let b = lock.read();
            assert_eq!(*a + *b, 0);
        }
        *lock.write() = 5;
        assert_eq!(*lock.read(), 5);

        let events = serial_events(&profiler);
        assert!(matches!(events[0], Event::LockAnnounce { shared: true, .. }));
        let shared_obtains = events.iter().filter(|e| matches!(e, Event::LockSharedObtain { .. })).count();
        let exclusive_obtains = events.iter().filter(|e| matches!(e, Event::LockObtain { .. })).count();
        assert_eq!(shared_obtains, 3);
        assert_eq!(exclusive_obtains, 1);
        profiler.shutdown();
    }

    #[test]
    fn test_dropped_locks_are_not_replayed() {
        let profiler = idle_profiler(Config { on_demand: true, ..Config::local_ephemeral() });
        let kept = TracedMutex::with_profiler((), &SITE, Some(Arc::clone(&profiler)));
        for _ in 0..1000 {
            let lock = TracedRwLock::with_profiler(0u8, &SITE, Some(Arc::clone(&profiler)));
            lock.set_name("scratch");
        }
        assert_eq!(profiler.shared.deferred.len(), 1);
        assert!(serial_events(&profiler).is_empty());
        drop(kept);
        assert!(profiler.shared.deferred.is_empty());
        profiler.shutdown();
    }
}
