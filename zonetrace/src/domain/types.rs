//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep OS thread ids, process ids and connection
//! epochs from being mixed up in function signatures.

use std::fmt;

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pid(pub u32);

impl Pid {
    /// Id of the calling process
    #[must_use]
    pub fn current() -> Self {
        Pid(std::process::id())
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

/// Thread ID
///
/// The kernel thread id on Linux; a process-unique sequential id elsewhere.
/// This is what the wire protocol carries in `ThreadContext` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Id of the calling thread
    #[must_use]
    pub fn current() -> Self {
        thread_local! {
            static CURRENT: ThreadId = ThreadId(os_thread_id());
        }
        CURRENT.with(|id| *id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)] // gettid has no safe wrapper
fn os_thread_id() -> u32 {
    // SAFETY: SYS_gettid takes no arguments and cannot fail
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    u32::try_from(tid).unwrap_or(u32::MAX)
}

#[cfg(not(target_os = "linux"))]
fn os_thread_id() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static NEXT: AtomicU32 = AtomicU32::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Connection epoch
///
/// Bumped by the worker when a collector attaches and again when it
/// detaches, so an odd value means a session is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(pub u32);

impl Epoch {
    /// Returns true while a collector session is live
    #[must_use]
    pub fn is_connected(self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch#{}", self.0)
    }
}
