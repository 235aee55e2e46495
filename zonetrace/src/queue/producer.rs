//! Explicit producers and their tokens
//!
//! Each instrumented thread owns one producer through a [`ProducerToken`].
//! The producer keeps its blocks in a private circular ring and publishes
//! slots by advancing `tail_index` with a release store. Consumers claim
//! ranges by advancing `head_index` and locate the block for an index through
//! a circular block index that the producer grows by doubling.
//!
//! ```text
//!          ring of blocks (producer-private links)
//!     ┌──────────┐   ┌──────────┐   ┌──────────┐
//!  ┌─▶│ base 128 │──▶│ base 192 │──▶│ base 256 │──┐
//!  │  └──────────┘   └──────────┘   └──────────┘  │
//!  └───────────────────────────────────────────────┘
//!        ▲ head (consumers)              ▲ tail (producer)
//!
//!  block index: [.., (128, ●), (192, ●), (256, ●) ← front, ..]
//! ```
//!
//! Producers are never unlinked from the queue's producer list. When a token
//! is dropped the producer is marked inactive and its fully-dequeued blocks
//! (except the tail block) go back to the shared free-list; a later thread may
//! reactivate it once its backlog is empty.

#![allow(unsafe_code)] // owner-thread state lives in an UnsafeCell; slots are raw cells
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // indices are masked

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::block::{Block, BlockPool};
use super::consumer::DequeueSink;
use super::{ConcurrentQueue, DEFAULT_BLOCK_SIZE};
use crate::domain::QueueError;

const INITIAL_INDEX_SIZE: usize = 32;

/// `a < b` on wrapping indices
#[inline]
pub(crate) fn circular_less_than(a: u64, b: u64) -> bool {
    (a.wrapping_sub(b) as i64) < 0
}

struct BlockIndexEntry<T, const B: usize> {
    base: AtomicU64,
    block: AtomicPtr<Block<T, B>>,
}

impl<T, const B: usize> BlockIndexEntry<T, B> {
    fn empty() -> Self {
        Self { base: AtomicU64::new(0), block: AtomicPtr::new(ptr::null_mut()) }
    }
}

struct BlockIndexHeader<T, const B: usize> {
    size: usize,
    /// Position of the most recently added entry
    front: AtomicUsize,
    entries: Box<[BlockIndexEntry<T, B>]>,
    /// Superseded index, kept alive until the producer is dropped
    prev: *mut BlockIndexHeader<T, B>,
}

/// State touched only by the thread currently holding the token
struct OwnerState<T, const B: usize> {
    tail_block: *const Block<T, B>,
    index_slots_used: usize,
    index_size: usize,
    /// Next entry to write in the block index
    index_front: usize,
    /// Tail index whose block has already been set up by an uncommitted begin
    prepared: Option<u64>,
}

pub(crate) struct Producer<T, const B: usize> {
    tail_index: AtomicU64,
    head_index: AtomicU64,
    dequeue_optimistic_count: AtomicU64,
    dequeue_overcommit: AtomicU64,
    block_index: AtomicPtr<BlockIndexHeader<T, B>>,
    pub(crate) inactive: AtomicBool,
    pub(crate) thread_id: AtomicU64,
    /// Consumers between their thread snapshot and their last `sink` call
    pub(crate) dequeues_in_flight: AtomicUsize,
    /// Older neighbour in the queue's producer list; set once before publication
    pub(crate) next: AtomicPtr<Producer<T, B>>,
    owner: UnsafeCell<OwnerState<T, B>>,
}

impl<T, const B: usize> Producer<T, B> {
    pub(crate) fn new(thread_id: u64) -> Self {
        let entries = (0..INITIAL_INDEX_SIZE).map(|_| BlockIndexEntry::empty()).collect();
        let header = Box::new(BlockIndexHeader {
            size: INITIAL_INDEX_SIZE,
            front: AtomicUsize::new(INITIAL_INDEX_SIZE - 1),
            entries,
            prev: ptr::null_mut(),
        });
        Self {
            tail_index: AtomicU64::new(0),
            head_index: AtomicU64::new(0),
            dequeue_optimistic_count: AtomicU64::new(0),
            dequeue_overcommit: AtomicU64::new(0),
            block_index: AtomicPtr::new(Box::into_raw(header)),
            inactive: AtomicBool::new(false),
            thread_id: AtomicU64::new(thread_id),
            dequeues_in_flight: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
            owner: UnsafeCell::new(OwnerState {
                tail_block: ptr::null(),
                index_slots_used: 0,
                index_size: INITIAL_INDEX_SIZE,
                index_front: 0,
                prepared: None,
            }),
        }
    }

    /// Items published but not yet claimed by a consumer
    pub(crate) fn size_approx(&self) -> usize {
        let tail = self.tail_index.load(Ordering::Relaxed);
        let head = self.head_index.load(Ordering::Relaxed);
        if circular_less_than(head, tail) {
            tail.wrapping_sub(head) as usize
        } else {
            0
        }
    }

    /// Reserve the slot at the tail without publishing it
    ///
    /// # Safety
    /// Only the thread holding this producer's token may call this.
    unsafe fn enqueue_begin(
        &self,
        pool: &BlockPool<T, B>,
        can_alloc: bool,
    ) -> Result<(u64, *mut MaybeUninit<T>), QueueError> {
        let owner = &mut *self.owner.get();
        let tail = self.tail_index.load(Ordering::Relaxed);
        if tail & (B as u64 - 1) == 0 && owner.prepared != Some(tail) {
            self.prepare_block(owner, pool, tail, can_alloc)?;
            owner.prepared = Some(tail);
        }
        Ok((tail, (*owner.tail_block).slot(tail)))
    }

    /// Move the tail onto a fresh block for a block-boundary index
    unsafe fn prepare_block(
        &self,
        owner: &mut OwnerState<T, B>,
        pool: &BlockPool<T, B>,
        tail: u64,
        can_alloc: bool,
    ) -> Result<(), QueueError> {
        let reusable = if owner.tail_block.is_null() {
            None
        } else {
            let next = (*owner.tail_block).next.load(Ordering::Relaxed);
            (*next).is_empty().then_some(next)
        };

        if let Some(next) = reusable {
            (*next).reset_empty();
            owner.tail_block = next;
        } else {
            if owner.index_slots_used == owner.index_size {
                self.grow_block_index(owner);
            }
            let block = pool.requisition(can_alloc).ok_or(QueueError::NoBlockAvailable)?;
            (*block).reset_empty();
            if owner.tail_block.is_null() {
                (*block).next.store(block.cast_mut(), Ordering::Relaxed);
            } else {
                let after = (*owner.tail_block).next.load(Ordering::Relaxed);
                (*block).next.store(after, Ordering::Relaxed);
                (*owner.tail_block).next.store(block.cast_mut(), Ordering::Relaxed);
            }
            owner.tail_block = block;
            owner.index_slots_used += 1;
        }

        let header = &*self.block_index.load(Ordering::Relaxed);
        let entry = &header.entries[owner.index_front];
        entry.base.store(tail, Ordering::Relaxed);
        entry.block.store(owner.tail_block.cast_mut(), Ordering::Relaxed);
        header.front.store(owner.index_front, Ordering::Release);
        owner.index_front = (owner.index_front + 1) & (owner.index_size - 1);
        Ok(())
    }

    unsafe fn grow_block_index(&self, owner: &mut OwnerState<T, B>) {
        let old_ptr = self.block_index.load(Ordering::Relaxed);
        let old = &*old_ptr;
        let old_mask = owner.index_size - 1;
        let new_size = owner.index_size << 1;

        let entries: Box<[BlockIndexEntry<T, B>]> =
            (0..new_size).map(|_| BlockIndexEntry::empty()).collect();
        let mut copied = 0;
        if owner.index_slots_used != 0 {
            let mut i = owner.index_front.wrapping_sub(owner.index_slots_used) & old_mask;
            loop {
                let from = &old.entries[i];
                entries[copied].base.store(from.base.load(Ordering::Relaxed), Ordering::Relaxed);
                entries[copied].block.store(from.block.load(Ordering::Relaxed), Ordering::Relaxed);
                copied += 1;
                i = (i + 1) & old_mask;
                if i == owner.index_front {
                    break;
                }
            }
        }

        let header = Box::new(BlockIndexHeader {
            size: new_size,
            front: AtomicUsize::new(copied.wrapping_sub(1) & (new_size - 1)),
            entries,
            prev: old_ptr,
        });
        owner.index_size = new_size;
        owner.index_front = copied & (new_size - 1);
        self.block_index.store(Box::into_raw(header), Ordering::Release);
    }

    /// Claim and move out up to `max` published items
    ///
    /// The owning thread is read before the claim, so items are announced
    /// under the thread that wrote them even if the producer is reactivated
    /// meanwhile (see `ConcurrentQueue::recycle_producer`).
    pub(crate) fn dequeue_bulk<S>(&self, max: usize, sink: &mut S) -> usize
    where
        S: DequeueSink<T> + ?Sized,
    {
        self.dequeues_in_flight.fetch_add(1, Ordering::SeqCst);
        let thread_id = self.thread_id.load(Ordering::SeqCst);
        let count = self.dequeue_claimed(thread_id, max, sink);
        self.dequeues_in_flight.fetch_sub(1, Ordering::Release);
        count
    }

    fn dequeue_claimed<S>(&self, thread_id: u64, max: usize, sink: &mut S) -> usize
    where
        S: DequeueSink<T> + ?Sized,
    {
        let tail = self.tail_index.load(Ordering::Relaxed);
        let overcommit = self.dequeue_overcommit.load(Ordering::Relaxed);
        let available = tail
            .wrapping_sub(self.dequeue_optimistic_count.load(Ordering::Relaxed).wrapping_sub(overcommit));
        if !circular_less_than(0, available) || max == 0 {
            return 0;
        }

        let desired = available.min(max as u64);
        fence(Ordering::Acquire);
        let my_count = self.dequeue_optimistic_count.fetch_add(desired, Ordering::Relaxed);
        let tail = self.tail_index.load(Ordering::Acquire);
        let actual = tail.wrapping_sub(my_count.wrapping_sub(overcommit));
        if !circular_less_than(0, actual) {
            self.dequeue_overcommit.fetch_add(desired, Ordering::Release);
            return 0;
        }

        let actual = actual.min(desired);
        if actual < desired {
            self.dequeue_overcommit.fetch_add(desired - actual, Ordering::Release);
        }

        let first_index = self.head_index.fetch_add(actual, Ordering::AcqRel);
        let end_index = first_index.wrapping_add(actual);

        // SAFETY: headers are freed only when the producer is dropped, and the
        // entries for every published index were written before the tail store
        let header = unsafe { &*self.block_index.load(Ordering::Acquire) };
        let front = header.front.load(Ordering::Acquire);
        let mask = header.size - 1;
        let front_base = header.entries[front].base.load(Ordering::Relaxed);
        let first_block_base = first_index & !(B as u64 - 1);
        let offset = (first_block_base.wrapping_sub(front_base) as i64) / B as i64;
        let mut slot = front.wrapping_add_signed(offset as isize) & mask;

        sink.thread(thread_id);

        let mut index = first_index;
        while index != end_index {
            let block_end = (index & !(B as u64 - 1)).wrapping_add(B as u64);
            let run_end = if circular_less_than(block_end, end_index) { block_end } else { end_index };
            // SAFETY: claimed indices live in blocks that stay alive until
            // their slots are marked empty below
            let block = unsafe { &*header.entries[slot].block.load(Ordering::Relaxed) };
            let run_start = index;
            while index != run_end {
                // SAFETY: the slot was initialized before the release store of
                // tail_index we acquired, and the head claim makes it ours
                let item = unsafe { (*block.slot(index)).assume_init_read() };
                sink.item(item);
                index = index.wrapping_add(1);
            }
            block.set_many_empty(run_start, run_end.wrapping_sub(run_start) as usize);
            slot = (slot + 1) & mask;
        }

        actual as usize
    }

    /// Hand fully-dequeued blocks other than the tail block back to the pool
    ///
    /// # Safety
    /// Only the token holder may call this, immediately before retiring.
    unsafe fn shed_empty_blocks(&self, pool: &BlockPool<T, B>) {
        let owner = &mut *self.owner.get();
        let tail = owner.tail_block;
        if tail.is_null() {
            return;
        }
        let mut prev = tail;
        let mut current = (*tail).next.load(Ordering::Relaxed).cast_const();
        while current != tail {
            let next = (*current).next.load(Ordering::Relaxed);
            if (*current).is_empty() {
                (*prev).next.store(next, Ordering::Relaxed);
                owner.index_slots_used -= 1;
                pool.release(current);
            } else {
                prev = current;
            }
            current = next.cast_const();
        }
    }
}

impl<T, const B: usize> Drop for Producer<T, B> {
    fn drop(&mut self) {
        // Drop any values nobody dequeued
        let mut discard = (|_: u64| {}, drop::<T>);
        while self.dequeue_bulk(usize::MAX, &mut discard) > 0 {}

        let owner = self.owner.get_mut();
        if !owner.tail_block.is_null() {
            let start = owner.tail_block;
            // SAFETY: exclusive access at teardown; ring blocks are alive and
            // heap blocks were allocated with Box
            unsafe {
                let mut current = start;
                loop {
                    let next = (*current).next.load(Ordering::Relaxed).cast_const();
                    if (*current).heap {
                        drop(Box::from_raw(current.cast_mut()));
                    }
                    if next == start {
                        break;
                    }
                    current = next;
                }
            }
        }

        let mut header = *self.block_index.get_mut();
        while !header.is_null() {
            // SAFETY: every header was created with Box::into_raw and is owned here
            let boxed = unsafe { Box::from_raw(header) };
            header = boxed.prev;
        }
    }
}

/// A thread's handle to its own producer
///
/// Holding the token grants exclusive enqueue rights; dropping it retires
/// the producer.
pub struct ProducerToken<T, const B: usize = DEFAULT_BLOCK_SIZE> {
    queue: Arc<ConcurrentQueue<T, B>>,
    producer: NonNull<Producer<T, B>>,
}

// SAFETY: the token is the single owner of its producer's owner-state; moving
// it to another thread moves that ownership with it.
unsafe impl<T: Send, const B: usize> Send for ProducerToken<T, B> {}

impl<T, const B: usize> ProducerToken<T, B> {
    pub(crate) fn new(queue: Arc<ConcurrentQueue<T, B>>, producer: NonNull<Producer<T, B>>) -> Self {
        Self { queue, producer }
    }

    fn producer(&self) -> &Producer<T, B> {
        // SAFETY: producers live as long as the queue, which the token keeps alive
        unsafe { self.producer.as_ref() }
    }

    /// Reserve the next slot, allocating a block from the heap if needed
    ///
    /// # Errors
    /// Never fails in practice; the heap tier always yields a block.
    pub fn enqueue_begin(&mut self) -> Result<EnqueueSlot<'_, T, B>, QueueError> {
        self.begin(true)
    }

    /// Reserve the next slot using only pooled or recycled blocks
    ///
    /// # Errors
    /// `QueueError::NoBlockAvailable` when a new block is needed and neither
    /// the initial pool nor the free-list has one.
    pub fn try_enqueue_begin(&mut self) -> Result<EnqueueSlot<'_, T, B>, QueueError> {
        self.begin(false)
    }

    fn begin(&mut self, can_alloc: bool) -> Result<EnqueueSlot<'_, T, B>, QueueError> {
        let producer = self.producer();
        // SAFETY: &mut self proves we are the token holder
        let (index, slot) = unsafe { producer.enqueue_begin(&self.queue.pool, can_alloc)? };
        Ok(EnqueueSlot { producer, index, slot, _token: PhantomData })
    }

    /// Reserve and commit in one step
    ///
    /// # Errors
    /// Same as [`ProducerToken::enqueue_begin`].
    pub fn enqueue(&mut self, item: T) -> Result<(), QueueError> {
        self.enqueue_begin()?.commit(item);
        Ok(())
    }

    /// Published items of this producer not yet claimed by a consumer
    #[must_use]
    pub fn size_approx(&self) -> usize {
        self.producer().size_approx()
    }

    #[must_use]
    pub fn thread_id(&self) -> u64 {
        self.producer().thread_id.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<ConcurrentQueue<T, B>> {
        &self.queue
    }

    pub(crate) fn producer_ptr(&self) -> *const Producer<T, B> {
        self.producer.as_ptr().cast_const()
    }
}

impl<T, const B: usize> Drop for ProducerToken<T, B> {
    fn drop(&mut self) {
        let producer = self.producer();
        // SAFETY: we are still the token holder until `inactive` is set
        unsafe { producer.shed_empty_blocks(&self.queue.pool) };
        producer.inactive.store(true, Ordering::Release);
        self.queue.producer_list_changed();
    }
}

/// A reserved, unpublished slot
///
/// Dropping it without [`EnqueueSlot::commit`] publishes nothing; the next
/// `enqueue_begin` hands out the same slot again.
pub struct EnqueueSlot<'a, T, const B: usize> {
    producer: &'a Producer<T, B>,
    index: u64,
    slot: *mut MaybeUninit<T>,
    _token: PhantomData<&'a mut ()>,
}

impl<T, const B: usize> EnqueueSlot<'_, T, B> {
    /// Write the value in place and make it visible to consumers
    pub fn commit(self, item: T) {
        // SAFETY: the slot is reserved for us and not visible to consumers yet
        unsafe { (*self.slot).write(item) };
        self.producer.tail_index.store(self.index.wrapping_add(1), Ordering::Release);
    }

    /// Queue index this slot will occupy
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }
}
