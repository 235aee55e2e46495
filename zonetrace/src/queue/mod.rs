//! # Lock-free multi-producer event queue
//!
//! Every instrumented thread writes into its own producer without touching
//! shared state in the common case. One or more consumers drain producers in
//! bulk and rotate between them.
//!
//! ```text
//!   thread A ─ ProducerToken ─▶ Producer A ─┐
//!   thread B ─ ProducerToken ─▶ Producer B ─┼─ producer list ◀── ConsumerToken
//!   thread C ─ ProducerToken ─▶ Producer C ─┘   (push-front)      (rotating)
//!
//!                 blocks: initial pool ▶ free-list ▶ heap
//! ```
//!
//! ## Enqueue
//!
//! Writing is split in two so callers can fill the slot in place:
//! [`ProducerToken::enqueue_begin`] reserves the slot and
//! [`EnqueueSlot::commit`] publishes it with a release store of the tail.
//!
//! ## Lifetime
//!
//! Producers are created lazily and never unlinked. Dropping a token retires
//! its producer; a later token reactivates a retired producer once its
//! backlog is empty and no consumer is still reading it. Memory is reclaimed when the queue itself is dropped.

#![allow(unsafe_code)] // producer list of raw, queue-owned nodes

mod block;
mod consumer;
mod free_list;
mod producer;

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

pub use block::EMPTY_COUNTER_THRESHOLD;
pub use consumer::{ConsumerToken, DequeueSink};
pub use free_list::{FreeList, FreeListLinks, FreeListNode};
pub use producer::{EnqueueSlot, ProducerToken};

use block::BlockPool;
use consumer::CONSUMPTION_QUOTA_BEFORE_ROTATE;
use producer::Producer;

/// Slots per block unless stated otherwise
pub const DEFAULT_BLOCK_SIZE: usize = 64;

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Block-based MPMC queue with explicit producer and consumer tokens
pub struct ConcurrentQueue<T, const B: usize = DEFAULT_BLOCK_SIZE> {
    /// Most recently added producer; older ones follow through `next`
    producer_list_tail: AtomicPtr<Producer<T, B>>,
    producer_count: AtomicU32,
    next_consumer_id: AtomicU32,
    global_consumer_offset: AtomicU32,
    id: u64,
    pub(crate) pool: BlockPool<T, B>,
}

// SAFETY: values of T move between threads through the queue; all shared
// state is atomics or owner-thread state guarded by the token protocol.
unsafe impl<T: Send, const B: usize> Send for ConcurrentQueue<T, B> {}
unsafe impl<T: Send, const B: usize> Sync for ConcurrentQueue<T, B> {}

impl<T, const B: usize> ConcurrentQueue<T, B> {
    /// Build a queue with `initial_blocks` pre-reserved blocks
    #[must_use]
    pub fn new(initial_blocks: usize) -> Self {
        Self {
            producer_list_tail: AtomicPtr::new(ptr::null_mut()),
            producer_count: AtomicU32::new(0),
            next_consumer_id: AtomicU32::new(0),
            global_consumer_offset: AtomicU32::new(0),
            id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
            pool: BlockPool::new(initial_blocks),
        }
    }

    /// Claim a producer for the calling thread
    ///
    /// Reuses a retired producer with an empty backlog when one exists.
    #[must_use]
    pub fn producer_token(self: &Arc<Self>, thread_id: u64) -> ProducerToken<T, B> {
        let producer = self.recycle_producer(thread_id).unwrap_or_else(|| self.add_producer(thread_id));
        ProducerToken::new(Arc::clone(self), producer)
    }

    fn recycle_producer(&self, thread_id: u64) -> Option<NonNull<Producer<T, B>>> {
        let mut ptr = self.producer_list_tail.load(Ordering::Acquire);
        while let Some(node) = NonNull::new(ptr) {
            // SAFETY: producers stay allocated until the queue is dropped
            let producer = unsafe { node.as_ref() };
            if producer.inactive.load(Ordering::Acquire)
                && producer.size_approx() == 0
                && producer
                    .inactive
                    .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                producer.thread_id.store(thread_id, Ordering::SeqCst);
                // A consumer that read the old owner may still be claiming;
                // the new owner must not publish until it is done
                while producer.dequeues_in_flight.load(Ordering::SeqCst) != 0 {
                    std::thread::yield_now();
                }
                self.producer_list_changed();
                return Some(node);
            }
            ptr = producer.next.load(Ordering::Relaxed);
        }
        None
    }

    fn add_producer(&self, thread_id: u64) -> NonNull<Producer<T, B>> {
        let node = Box::into_raw(Box::new(Producer::new(thread_id)));
        self.producer_count.fetch_add(1, Ordering::Relaxed);
        let mut tail = self.producer_list_tail.load(Ordering::Relaxed);
        loop {
            // SAFETY: not yet published, so we are the only writer
            unsafe { (*node).next.store(tail, Ordering::Relaxed) };
            match self.producer_list_tail.compare_exchange_weak(
                tail,
                node,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => tail = actual,
            }
        }
        self.producer_list_changed();
        // SAFETY: Box::into_raw never returns null
        unsafe { NonNull::new_unchecked(node) }
    }

    /// Nudge consumers to re-balance
    pub(crate) fn producer_list_changed(&self) {
        self.global_consumer_offset.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn consumer_token(&self) -> ConsumerToken {
        ConsumerToken::new(self.id, self.next_consumer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Dequeue up to `max` items into `sink`, returning how many were taken
    pub fn try_dequeue_bulk<S>(&self, token: &mut ConsumerToken, max: usize, sink: &mut S) -> usize
    where
        S: DequeueSink<T> + ?Sized,
    {
        if token.queue_id != self.id {
            *token = self.consumer_token();
        }
        if (token.desired::<T, B>().is_null()
            || token.last_known_global_offset != self.global_consumer_offset.load(Ordering::Relaxed))
            && !self.update_current_producer_after_rotation(token)
        {
            return 0;
        }

        let start = token.current::<T, B>();
        // SAFETY: token pointers always refer to producers of this queue
        let mut count = unsafe { (*start).dequeue_bulk(max, sink) };
        if count == max {
            token.items_consumed_from_current =
                token.items_consumed_from_current.saturating_add(saturate_u32(max));
            if token.items_consumed_from_current >= CONSUMPTION_QUOTA_BEFORE_ROTATE {
                self.producer_list_changed();
            }
            return max;
        }
        token.items_consumed_from_current += saturate_u32(count);

        let tail = self.producer_list_tail.load(Ordering::Acquire);
        let mut ptr = self.next_or_wrap(start, tail);
        while ptr != start {
            // SAFETY: as above
            let dequeued = unsafe { (*ptr).dequeue_bulk(max - count, sink) };
            count += dequeued;
            if dequeued != 0 {
                token.current_producer = ptr.cast();
                token.items_consumed_from_current = saturate_u32(dequeued);
            }
            if count == max {
                break;
            }
            ptr = self.next_or_wrap(ptr, tail);
        }
        count
    }

    fn next_or_wrap(&self, ptr: *const Producer<T, B>, tail: *mut Producer<T, B>) -> *const Producer<T, B> {
        // SAFETY: producers are never freed while the queue is alive
        let next = unsafe { (*ptr).next.load(Ordering::Relaxed) };
        if next.is_null() { tail } else { next }.cast_const()
    }

    fn update_current_producer_after_rotation(&self, token: &mut ConsumerToken) -> bool {
        let tail = self.producer_list_tail.load(Ordering::Acquire);
        if token.desired::<T, B>().is_null() && tail.is_null() {
            return false;
        }
        let producer_count = self.producer_count.load(Ordering::Relaxed).max(1);
        let global_offset = self.global_consumer_offset.load(Ordering::Relaxed);

        let mut desired = token.desired::<T, B>();
        if desired.is_null() {
            let offset = producer_count - 1 - (token.initial_offset % producer_count);
            desired = tail.cast_const();
            for _ in 0..offset {
                desired = self.next_or_wrap(desired, tail);
            }
        }

        let delta = global_offset.wrapping_sub(token.last_known_global_offset) % producer_count;
        for _ in 0..delta {
            desired = self.next_or_wrap(desired, tail);
        }

        token.last_known_global_offset = global_offset;
        token.desired_producer = desired.cast();
        token.current_producer = desired.cast();
        token.items_consumed_from_current = 0;
        true
    }

    /// Drain and drop everything currently published
    pub fn clear(&self, token: &mut ConsumerToken) -> usize {
        let mut discard = (|_: u64| {}, drop::<T>);
        let mut total = 0;
        loop {
            let n = self.try_dequeue_bulk(token, 1024, &mut discard);
            if n == 0 {
                return total;
            }
            total += n;
        }
    }

    /// Sum of unclaimed items across producers
    #[must_use]
    pub fn size_approx(&self) -> usize {
        let mut total = 0;
        let mut ptr = self.producer_list_tail.load(Ordering::Acquire);
        while !ptr.is_null() {
            // SAFETY: producers stay allocated until the queue is dropped
            let producer = unsafe { &*ptr };
            total += producer.size_approx();
            ptr = producer.next.load(Ordering::Relaxed);
        }
        total
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producer_count.load(Ordering::Relaxed) as usize
    }

    /// Blocks that came from the heap after the pool and free-list ran dry
    #[must_use]
    pub fn heap_blocks(&self) -> usize {
        self.pool.heap_blocks()
    }
}

impl<T, const B: usize> ProducerToken<T, B> {
    /// True when this token's producer is the one the consumer reads next
    #[must_use]
    pub fn is_current_for(&self, token: &ConsumerToken) -> bool {
        ptr::eq(token.current::<T, B>(), self.producer_ptr())
    }
}

impl<T, const B: usize> Drop for ConcurrentQueue<T, B> {
    fn drop(&mut self) {
        let mut ptr = *self.producer_list_tail.get_mut();
        while !ptr.is_null() {
            // SAFETY: every producer was created by Box::into_raw in
            // add_producer and no token can outlive the queue
            let producer = unsafe { Box::from_raw(ptr) };
            ptr = producer.next.load(Ordering::Relaxed);
        }
    }
}

fn saturate_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::QueueError;
    use std::collections::HashMap;

    /// Tags every item with the thread announced before it
    struct Tagged<T> {
        thread: u64,
        items: Vec<(u64, T)>,
    }

    impl<T> DequeueSink<T> for Tagged<T> {
        fn thread(&mut self, thread_id: u64) {
            self.thread = thread_id;
        }

        fn item(&mut self, item: T) {
            self.items.push((self.thread, item));
        }
    }

    fn collect<T, const B: usize>(
        queue: &ConcurrentQueue<T, B>,
        token: &mut ConsumerToken,
        max: usize,
    ) -> Vec<(u64, T)> {
        let mut sink = Tagged { thread: u64::MAX, items: Vec::new() };
        let n = queue.try_dequeue_bulk(token, max, &mut sink);
        assert_eq!(n, sink.items.len());
        sink.items
    }

    #[test]
    fn test_single_producer_fifo_across_blocks() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(2));
        let mut producer = queue.producer_token(11);
        for i in 0..50 {
            producer.enqueue(i).unwrap();
        }
        assert_eq!(queue.size_approx(), 50);

        let mut consumer = queue.consumer_token();
        let mut seen = Vec::new();
        loop {
            let batch = collect(&queue, &mut consumer, 7);
            if batch.is_empty() {
                break;
            }
            seen.extend(batch);
        }
        assert!(seen.iter().all(|(tid, _)| *tid == 11));
        assert_eq!(seen.into_iter().map(|(_, v)| v).collect::<Vec<_>>(), (0..50).collect::<Vec<_>>());
        assert_eq!(queue.size_approx(), 0);
    }

    #[test]
    fn test_uncommitted_slot_publishes_nothing() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(1));
        let mut producer = queue.producer_token(1);
        let slot = producer.enqueue_begin().unwrap();
        assert_eq!(slot.index(), 0);
        drop(slot);
        assert_eq!(queue.size_approx(), 0);

        let slot = producer.enqueue_begin().unwrap();
        assert_eq!(slot.index(), 0);
        slot.commit(5);
        let mut consumer = queue.consumer_token();
        assert_eq!(collect(&queue, &mut consumer, 10), vec![(1, 5)]);
    }

    #[test]
    fn test_try_enqueue_fails_without_blocks_then_reuses_drained_block() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(1));
        let mut producer = queue.producer_token(1);
        for i in 0..4 {
            producer.try_enqueue_begin().unwrap().commit(i);
        }
        assert_eq!(producer.try_enqueue_begin().err(), Some(QueueError::NoBlockAvailable));
        assert_eq!(queue.size_approx(), 4);

        let mut consumer = queue.consumer_token();
        assert_eq!(collect(&queue, &mut consumer, 16).len(), 4);

        // The only block in the ring is empty again and can be refilled
        producer.try_enqueue_begin().unwrap().commit(99);
        assert_eq!(collect(&queue, &mut consumer, 16), vec![(1, 99)]);
        assert_eq!(queue.heap_blocks(), 0);
    }

    #[test]
    fn test_block_index_grows_past_initial_size() {
        let queue: Arc<ConcurrentQueue<u64, 2>> = Arc::new(ConcurrentQueue::new(0));
        let mut producer = queue.producer_token(3);
        // 200 live blocks forces several index doublings
        for i in 0..400 {
            producer.enqueue(i).unwrap();
        }
        let mut consumer = queue.consumer_token();
        let mut values = Vec::new();
        loop {
            let batch = collect(&queue, &mut consumer, 33);
            if batch.is_empty() {
                break;
            }
            values.extend(batch.into_iter().map(|(_, v)| v));
        }
        assert_eq!(values, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_retired_producer_is_reactivated_empty() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(4));
        let mut consumer = queue.consumer_token();

        let mut first = queue.producer_token(1);
        for i in 0..10 {
            first.enqueue(i).unwrap();
        }
        assert_eq!(collect(&queue, &mut consumer, 100).len(), 10);
        drop(first);
        assert_eq!(queue.producer_count(), 1);

        let mut second = queue.producer_token(2);
        assert_eq!(queue.producer_count(), 1);
        assert_eq!(second.size_approx(), 0);
        assert_eq!(second.thread_id(), 2);

        second.enqueue(42).unwrap();
        assert_eq!(collect(&queue, &mut consumer, 100), vec![(2, 42)]);
    }

    #[test]
    fn test_reactivation_waits_for_dequeue_in_flight() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(4));
        let mut first = queue.producer_token(1);
        for i in 0..3 {
            first.enqueue(i).unwrap();
        }
        drop(first);

        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (resume_tx, resume_rx) = crossbeam_channel::bounded::<()>(1);
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut token = queue.consumer_token();
                let current = std::cell::Cell::new(u64::MAX);
                let mut items = Vec::new();
                let mut gate = Some((started_tx, resume_rx));
                let mut gated = (
                    |tid: u64| current.set(tid),
                    |item: u32| {
                        // Hold the claim open at the first item
                        if let Some((started, resume)) = gate.take() {
                            started.send(()).unwrap();
                            resume.recv().unwrap();
                        }
                        items.push((current.get(), item));
                    },
                );
                assert_eq!(queue.try_dequeue_bulk(&mut token, 10, &mut gated), 3);
                items
            })
        };

        started_rx.recv().unwrap();
        assert_eq!(queue.size_approx(), 0);
        let recycler = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut second = queue.producer_token(2);
                second.enqueue(42).unwrap();
                second.thread_id()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!recycler.is_finished(), "reactivated while a dequeue was in flight");

        resume_tx.send(()).unwrap();
        assert_eq!(consumer.join().unwrap(), vec![(1, 0), (1, 1), (1, 2)]);
        assert_eq!(recycler.join().unwrap(), 2);
        assert_eq!(queue.producer_count(), 1);

        let mut token = queue.consumer_token();
        assert_eq!(collect(&queue, &mut token, 10), vec![(2, 42)]);
    }

    #[test]
    fn test_retired_producer_with_backlog_is_not_reused() {
        let queue: Arc<ConcurrentQueue<u32, 4>> = Arc::new(ConcurrentQueue::new(4));
        let mut first = queue.producer_token(1);
        first.enqueue(7).unwrap();
        drop(first);

        let second = queue.producer_token(2);
        assert_eq!(queue.producer_count(), 2);
        assert_eq!(second.size_approx(), 0);

        let mut consumer = queue.consumer_token();
        assert_eq!(collect(&queue, &mut consumer, 10), vec![(1, 7)]);
    }

    #[test]
    fn test_consumer_rotates_between_busy_producers() {
        let queue: Arc<ConcurrentQueue<u32>> = Arc::new(ConcurrentQueue::new(8));
        let mut a = queue.producer_token(1);
        let mut b = queue.producer_token(2);
        for i in 0..1000 {
            a.enqueue(i).unwrap();
            b.enqueue(i).unwrap();
        }

        let mut consumer = queue.consumer_token();
        let mut per_thread: HashMap<u64, usize> = HashMap::new();
        for _ in 0..60 {
            for (tid, _) in collect(&queue, &mut consumer, 10) {
                *per_thread.entry(tid).or_default() += 1;
            }
        }
        assert_eq!(per_thread.values().sum::<usize>(), 600);
        assert!(per_thread.get(&1).copied().unwrap_or(0) > 0);
        assert!(per_thread.get(&2).copied().unwrap_or(0) > 0);
    }

    #[test]
    fn test_concurrent_producers_exactly_once_in_order() {
        const THREADS: u64 = 6;
        const PER_THREAD: u64 = 20_000;

        let queue: Arc<ConcurrentQueue<(u64, u64), 32>> = Arc::new(ConcurrentQueue::new(16));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    let mut token = queue.producer_token(t);
                    for i in 0..PER_THREAD {
                        token.enqueue((t, i)).unwrap();
                    }
                })
            })
            .collect();

        let mut consumer = queue.consumer_token();
        let mut next: HashMap<u64, u64> = HashMap::new();
        let mut total = 0;
        let mut finished = false;
        while total < THREADS * PER_THREAD {
            let mut sink = (
                |_tid: u64| {},
                |(t, i): (u64, u64)| {
                    let expected = next.entry(t).or_default();
                    assert_eq!(*expected, i, "out of order for producer {t}");
                    *expected += 1;
                    total += 1;
                },
            );
            if queue.try_dequeue_bulk(&mut consumer, 100, &mut sink) == 0 {
                if finished {
                    break;
                }
                finished = handles.iter().all(std::thread::JoinHandle::is_finished);
                std::thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total, THREADS * PER_THREAD);
        assert!(next.values().all(|&n| n == PER_THREAD));
    }

    #[test]
    fn test_drop_releases_undelivered_items() {
        let tracker = Arc::new(());
        {
            let queue: Arc<ConcurrentQueue<Arc<()>, 4>> = Arc::new(ConcurrentQueue::new(1));
            let mut producer = queue.producer_token(1);
            for _ in 0..37 {
                producer.enqueue(Arc::clone(&tracker)).unwrap();
            }
            let mut consumer = queue.consumer_token();
            let mut taken = Vec::new();
            queue.try_dequeue_bulk(
                &mut consumer,
                10,
                &mut (|_: u64| {}, |item: Arc<()>| taken.push(item)),
            );
            assert_eq!(Arc::strong_count(&tracker), 38);
            drop(taken);
            assert_eq!(Arc::strong_count(&tracker), 28);
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }

    #[test]
    fn test_clear_discards_everything() {
        let queue: Arc<ConcurrentQueue<String, 8>> = Arc::new(ConcurrentQueue::new(2));
        let mut producer = queue.producer_token(1);
        for i in 0..20 {
            producer.enqueue(format!("item {i}")).unwrap();
        }
        let mut consumer = queue.consumer_token();
        assert_eq!(queue.clear(&mut consumer), 20);
        assert_eq!(queue.size_approx(), 0);
    }
}
