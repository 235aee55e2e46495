//! Consumer-side rotation state and item sinks

use super::producer::Producer;

/// Items taken from one producer before the consumer moves on
pub(crate) const CONSUMPTION_QUOTA_BEFORE_ROTATE: u32 = 256;

/// Receives dequeued items
///
/// `thread` is called once per contiguous run with the originating
/// producer's thread id, before the run's items.
pub trait DequeueSink<T> {
    fn thread(&mut self, thread_id: u64);
    fn item(&mut self, item: T);
}

/// `(notify, process)` closure pair
impl<T, N, P> DequeueSink<T> for (N, P)
where
    N: FnMut(u64),
    P: FnMut(T),
{
    fn thread(&mut self, thread_id: u64) {
        (self.0)(thread_id);
    }

    fn item(&mut self, item: T) {
        (self.1)(item);
    }
}

/// Rotation state of an explicit consumer
///
/// Created by [`super::ConcurrentQueue::consumer_token`]. The token spreads
/// consumers over producers and rotates after each quota of items so that no
/// producer's backlog starves.
pub struct ConsumerToken {
    pub(crate) queue_id: u64,
    pub(crate) initial_offset: u32,
    pub(crate) last_known_global_offset: u32,
    pub(crate) items_consumed_from_current: u32,
    pub(crate) current_producer: *const (),
    pub(crate) desired_producer: *const (),
}

// SAFETY: the producer pointers are only dereferenced through the queue that
// issued the token, and producers outlive their queue's borrowers.
unsafe impl Send for ConsumerToken {}

impl ConsumerToken {
    pub(crate) fn new(queue_id: u64, initial_offset: u32) -> Self {
        Self {
            queue_id,
            initial_offset,
            last_known_global_offset: u32::MAX,
            items_consumed_from_current: 0,
            current_producer: std::ptr::null(),
            desired_producer: std::ptr::null(),
        }
    }

    pub(crate) fn current<T, const B: usize>(&self) -> *const Producer<T, B> {
        self.current_producer.cast()
    }

    pub(crate) fn desired<T, const B: usize>(&self) -> *const Producer<T, B> {
        self.desired_producer.cast()
    }
}

impl std::fmt::Debug for ConsumerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerToken")
            .field("queue_id", &self.queue_id)
            .field("initial_offset", &self.initial_offset)
            .field("items_consumed_from_current", &self.items_consumed_from_current)
            .finish_non_exhaustive()
    }
}
