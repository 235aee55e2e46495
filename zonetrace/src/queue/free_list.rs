//! Lock-free free-list with per-node reference counts
//!
//! Nodes are never deallocated while the list exists, so a thread that read a
//! stale head pointer can still touch the node safely; the reference count
//! only guards the `next` link. A node is linked into the list only when its
//! count is provably zero. Adds that race with an in-flight `try_get` set the
//! should-be-on-list bit and leave the insertion to whichever thread drops the
//! count back to zero.
//!
//! ```text
//!  refs (u32):  [ should-be-on-list : 1 | reference count : 31 ]
//! ```

#![allow(unsafe_code)] // intrusive raw-pointer list over type-stable nodes

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

const REFS_MASK: u32 = 0x7FFF_FFFF;
const SHOULD_BE_ON_FREELIST: u32 = 0x8000_0000;

/// Intrusive link fields embedded in every free-list node
pub struct FreeListLinks<N> {
    refs: AtomicU32,
    next: AtomicPtr<N>,
}

impl<N> FreeListLinks<N> {
    #[must_use]
    pub fn new() -> Self {
        Self { refs: AtomicU32::new(0), next: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Current reference count, ignoring the should-be-on-list bit
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed) & REFS_MASK
    }
}

impl<N> Default for FreeListLinks<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A type that can be threaded onto a [`FreeList`]
pub trait FreeListNode: Sized {
    fn links(&self) -> &FreeListLinks<Self>;
}

/// Treiber-style stack of reusable nodes
pub struct FreeList<N: FreeListNode> {
    head: AtomicPtr<N>,
}

// SAFETY: the list only hands out raw pointers; nodes are shared across
// threads through atomics alone.
unsafe impl<N: FreeListNode + Send> Send for FreeList<N> {}
unsafe impl<N: FreeListNode + Send> Sync for FreeList<N> {}

impl<N: FreeListNode> FreeList<N> {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: AtomicPtr::new(ptr::null_mut()) }
    }

    /// Return a node to the list
    ///
    /// # Safety
    /// `node` must outlive the list, must not already be on it, and must not
    /// be referenced by anyone who will keep using it after this call.
    pub unsafe fn add(&self, node: *const N) {
        let links = (*node).links();
        // Raise the flag; only the thread that sees the count at zero links it
        if links.refs.fetch_add(SHOULD_BE_ON_FREELIST, Ordering::AcqRel) == 0 {
            self.add_knowing_refcount_is_zero(node);
        }
    }

    /// Pop a node, or `None` if the list is empty
    pub fn try_get(&self) -> Option<*const N> {
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            let prev_head = head;
            // SAFETY: nodes are type-stable for the lifetime of the list
            let links = unsafe { (*head).links() };
            let refs = links.refs.load(Ordering::Relaxed);
            if refs & REFS_MASK == 0
                || links
                    .refs
                    .compare_exchange(refs, refs + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_err()
            {
                head = self.head.load(Ordering::Acquire);
                continue;
            }

            // Holding a reference pins `next` until we let go
            let next = links.next.load(Ordering::Relaxed);
            match self.head.compare_exchange(head, next, Ordering::Acquire, Ordering::Relaxed) {
                Ok(_) => {
                    debug_assert_eq!(links.refs.load(Ordering::Relaxed) & SHOULD_BE_ON_FREELIST, 0);
                    // Our reference plus the list's reference
                    links.refs.fetch_sub(2, Ordering::Release);
                    return Some(head);
                }
                Err(actual) => {
                    head = actual;
                    // SAFETY: as above
                    let prev_links = unsafe { (*prev_head).links() };
                    let refs = prev_links.refs.fetch_sub(1, Ordering::AcqRel);
                    if refs == SHOULD_BE_ON_FREELIST + 1 {
                        // SAFETY: the count just reached zero with the flag set,
                        // so this thread now owns the insertion
                        unsafe { self.add_knowing_refcount_is_zero(prev_head) };
                    }
                }
            }
        }
        None
    }

    unsafe fn add_knowing_refcount_is_zero(&self, node: *const N) {
        let links = (*node).links();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            links.next.store(head, Ordering::Relaxed);
            links.refs.store(1, Ordering::Release);
            match self.head.compare_exchange(
                head,
                node.cast_mut(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    // Retry only if nobody picked up a reference meanwhile;
                    // otherwise the last one out re-adds the node
                    if links.refs.fetch_add(SHOULD_BE_ON_FREELIST - 1, Ordering::Release) == 1 {
                        continue;
                    }
                    return;
                }
            }
        }
    }

    /// Unlink every node; requires exclusive access
    pub fn take_all(&mut self) -> Vec<*const N> {
        let mut nodes = Vec::new();
        let mut ptr = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !ptr.is_null() {
            nodes.push(ptr.cast_const());
            // SAFETY: exclusive access; nodes are alive
            ptr = unsafe { (*ptr).links().next.load(Ordering::Relaxed) };
        }
        nodes
    }
}

impl<N: FreeListNode> Default for FreeList<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;

    struct TestNode {
        links: FreeListLinks<TestNode>,
        in_use: AtomicBool,
        handed_out: AtomicUsize,
    }

    impl FreeListNode for TestNode {
        fn links(&self) -> &FreeListLinks<Self> {
            &self.links
        }
    }

    fn nodes(n: usize) -> Arc<[TestNode]> {
        (0..n)
            .map(|_| TestNode {
                links: FreeListLinks::new(),
                in_use: AtomicBool::new(false),
                handed_out: AtomicUsize::new(0),
            })
            .collect()
    }

    #[test]
    fn test_empty_list_returns_none() {
        let list: FreeList<TestNode> = FreeList::new();
        assert!(list.try_get().is_none());
    }

    #[test]
    fn test_lifo_order_single_thread() {
        let pool = nodes(3);
        let list = FreeList::new();
        for node in pool.iter() {
            unsafe { list.add(node) };
        }
        assert_eq!(list.try_get(), Some(&pool[2] as *const TestNode));
        assert_eq!(list.try_get(), Some(&pool[1] as *const TestNode));
        assert_eq!(list.try_get(), Some(&pool[0] as *const TestNode));
        assert!(list.try_get().is_none());
        for node in pool.iter() {
            assert_eq!(node.links.ref_count(), 0);
        }
    }

    #[test]
    fn test_concurrent_add_and_get_never_hands_out_twice() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 20_000;

        let pool = nodes(16);
        let list = Arc::new(FreeList::new());
        for node in pool.iter() {
            unsafe { list.add(node) };
        }

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let _keep_alive = &pool;
                    for _ in 0..ROUNDS {
                        if let Some(node) = list.try_get() {
                            let node = unsafe { &*node };
                            assert!(
                                !node.in_use.swap(true, Ordering::AcqRel),
                                "node handed out while in use"
                            );
                            node.handed_out.fetch_add(1, Ordering::Relaxed);
                            std::hint::spin_loop();
                            node.in_use.store(false, Ordering::Release);
                            unsafe { list.add(node) };
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Every node is back on the list exactly once
        let mut list = Arc::try_unwrap(list).ok().unwrap();
        let mut remaining = list.take_all();
        remaining.sort();
        remaining.dedup();
        assert_eq!(remaining.len(), pool.len());
        let total: usize = pool.iter().map(|n| n.handed_out.load(Ordering::Relaxed)).sum();
        assert!(total > 0);
    }
}
