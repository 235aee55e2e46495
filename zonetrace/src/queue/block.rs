//! Fixed-size slot blocks and the three-tier block allocator
//!
//! A block holds `B` slots. Producers fill slots in index order; consumers
//! mark them empty after moving the value out. A block can be reused (by its
//! producer) or released to the free-list only when every slot is empty.
//!
//! Emptiness is tracked with one flag per slot for small blocks and a single
//! counter for large ones:
//!
//! ```text
//!  B <= 32   [f0 f1 f2 ... fB-1]   per-slot AtomicBool
//!  B  > 32   completely_dequeued   AtomicUsize (== B when empty)
//! ```
//!
//! Blocks come from, in order: the initial pool reserved when the queue is
//! built, the lock-free free-list, then the heap.

#![allow(unsafe_code)] // slots are raw cells written by one thread and read by another
#![allow(clippy::cast_possible_truncation)] // slot indices are masked to B

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use super::free_list::{FreeList, FreeListLinks, FreeListNode};

/// Blocks up to this size use per-slot flags
pub const EMPTY_COUNTER_THRESHOLD: usize = 32;

pub(crate) struct Block<T, const B: usize> {
    slots: [UnsafeCell<MaybeUninit<T>>; B],
    empty_flags: [AtomicBool; B],
    completely_dequeued: AtomicUsize,
    /// Producer-private ring link
    pub(crate) next: AtomicPtr<Block<T, B>>,
    links: FreeListLinks<Block<T, B>>,
    /// Heap blocks are freed on teardown; pool blocks are owned by the pool
    pub(crate) heap: bool,
}

impl<T, const B: usize> Block<T, B> {
    const USE_FLAGS: bool = B <= EMPTY_COUNTER_THRESHOLD;

    pub(crate) fn new(heap: bool) -> Self {
        assert!(B.is_power_of_two() && B >= 2, "block size must be a power of two >= 2");
        Self {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            empty_flags: std::array::from_fn(|_| AtomicBool::new(true)),
            completely_dequeued: AtomicUsize::new(B),
            next: AtomicPtr::new(ptr::null_mut()),
            links: FreeListLinks::new(),
            heap,
        }
    }

    /// Raw slot for a queue index
    pub(crate) fn slot(&self, index: u64) -> *mut MaybeUninit<T> {
        self.slots[(index as usize) & (B - 1)].get()
    }

    /// True once every slot has been dequeued
    pub(crate) fn is_empty(&self) -> bool {
        let empty = if Self::USE_FLAGS {
            self.empty_flags.iter().all(|flag| flag.load(Ordering::Relaxed))
        } else {
            self.completely_dequeued.load(Ordering::Relaxed) == B
        };
        if empty {
            // Pairs with the release in set_many_empty
            fence(Ordering::Acquire);
        }
        empty
    }

    /// Mark `count` slots starting at `index` as dequeued
    ///
    /// Must be called after the values have been moved out.
    pub(crate) fn set_many_empty(&self, index: u64, count: usize) {
        if Self::USE_FLAGS {
            fence(Ordering::Release);
            let first = (index as usize) & (B - 1);
            for flag in &self.empty_flags[first..first + count] {
                flag.store(true, Ordering::Relaxed);
            }
        } else {
            self.completely_dequeued.fetch_add(count, Ordering::Release);
        }
    }

    /// Prepare for refilling; only the owning producer calls this
    pub(crate) fn reset_empty(&self) {
        if Self::USE_FLAGS {
            for flag in &self.empty_flags {
                flag.store(false, Ordering::Relaxed);
            }
        } else {
            self.completely_dequeued.store(0, Ordering::Relaxed);
        }
    }
}

impl<T, const B: usize> FreeListNode for Block<T, B> {
    fn links(&self) -> &FreeListLinks<Self> {
        &self.links
    }
}

/// Three-tier block allocator shared by all producers of one queue
pub(crate) struct BlockPool<T, const B: usize> {
    initial: Box<[Block<T, B>]>,
    initial_index: AtomicUsize,
    free_list: FreeList<Block<T, B>>,
    heap_blocks: AtomicUsize,
}

impl<T, const B: usize> BlockPool<T, B> {
    pub(crate) fn new(initial_blocks: usize) -> Self {
        Self {
            initial: (0..initial_blocks).map(|_| Block::new(false)).collect(),
            initial_index: AtomicUsize::new(0),
            free_list: FreeList::new(),
            heap_blocks: AtomicUsize::new(0),
        }
    }

    /// Take a block from the pool, the free-list, or (if allowed) the heap
    pub(crate) fn requisition(&self, can_alloc: bool) -> Option<*const Block<T, B>> {
        if self.initial_index.load(Ordering::Relaxed) < self.initial.len() {
            let index = self.initial_index.fetch_add(1, Ordering::Relaxed);
            if let Some(block) = self.initial.get(index) {
                return Some(ptr::from_ref(block));
            }
        }

        if let Some(block) = self.free_list.try_get() {
            return Some(block);
        }

        if can_alloc {
            self.heap_blocks.fetch_add(1, Ordering::Relaxed);
            return Some(Box::into_raw(Box::new(Block::new(true))).cast_const());
        }

        None
    }

    /// Give an empty block back for reuse by any producer
    ///
    /// # Safety
    /// The block must come from this pool, be fully dequeued, and be unlinked
    /// from every producer ring.
    pub(crate) unsafe fn release(&self, block: *const Block<T, B>) {
        self.free_list.add(block);
    }

    /// Number of blocks that had to come from the heap
    pub(crate) fn heap_blocks(&self) -> usize {
        self.heap_blocks.load(Ordering::Relaxed)
    }
}

impl<T, const B: usize> Drop for BlockPool<T, B> {
    fn drop(&mut self) {
        for block in self.free_list.take_all() {
            // SAFETY: free-list blocks hold no live values; heap blocks were
            // created by Box::into_raw in requisition and are owned by nobody else
            unsafe {
                if (*block).heap {
                    drop(Box::from_raw(block.cast_mut()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_block_tracks_each_slot() {
        let block: Block<u32, 4> = Block::new(false);
        block.reset_empty();
        assert!(!block.is_empty());
        block.set_many_empty(0, 2);
        assert!(!block.is_empty());
        block.set_many_empty(2, 2);
        assert!(block.is_empty());
    }

    #[test]
    fn test_large_block_counts_dequeued() {
        let block: Block<u32, 64> = Block::new(false);
        block.reset_empty();
        block.set_many_empty(0, 63);
        assert!(!block.is_empty());
        block.set_many_empty(63, 1);
        assert!(block.is_empty());
    }

    #[test]
    fn test_pool_tiers() {
        let pool: BlockPool<u32, 4> = BlockPool::new(1);
        let first = pool.requisition(false).unwrap();
        assert!(!unsafe { &*first }.heap);

        // Pool exhausted and free-list empty
        assert!(pool.requisition(false).is_none());

        let heap = pool.requisition(true).unwrap();
        assert!(unsafe { &*heap }.heap);
        assert_eq!(pool.heap_blocks(), 1);

        unsafe { pool.release(heap) };
        let again = pool.requisition(false).unwrap();
        assert_eq!(again, heap);
        assert_eq!(pool.heap_blocks(), 1);
        unsafe { pool.release(again) };
    }
}
