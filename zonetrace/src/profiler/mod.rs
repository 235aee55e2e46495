//! Producer side: the profiler handle and the instrumentation API
//!
//! A [`Profiler`] owns the listener and the worker thread. Instrumented code
//! normally goes through the process-wide instance installed by [`init`];
//! every free function here is a no-op until then and again after
//! [`shutdown`].
//!
//! ```text
//!  zone!() / message() / plot() ...
//!        │
//!        ▼
//!  current() ── TLS (generation, Arc<Profiler>) ── miss ──▶ GLOBAL read lock
//!        │
//!        ▼
//!  Profiler::submit ──▶ thread-local ProducerToken ──▶ MPMC queue ──┐
//!                  └──▶ serial queue (locks, memory, GPU) ─────────┼──▶ worker
//!                  └──▶ deferred log (on-demand, must-not-lose) ───┘
//! ```
//!
//! Producer-side failures never reach the application: when there is no
//! profiler, or no collector in on-demand mode, events are simply not made.

pub mod gpu;
pub mod lock;
pub mod zone;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::clock;
use crate::config::Config;
use crate::deferred::{retention, Retention};
use crate::dispatcher::{Shared, Worker, WorkerState};
use crate::domain::{Epoch, ProfilerError, ThreadId};
use crate::event::{Event, Payload, PlotFormat, QueueItem, SourceLocation};
use crate::handshake::{default_program_name, ProcessInfo};
use crate::query::ParameterCallback;
use crate::queue::ProducerToken;
use crate::symbolization::{default_resolver_factory, ResolverFactory};
use crate::transport::{Broadcaster, Listener, TcpEndpoint};

pub use gpu::GpuContext;
pub use lock::{TracedMutex, TracedMutexGuard, TracedRwLock, TracedRwLockReadGuard, TracedRwLockWriteGuard};
pub use zone::Zone;

/// Deepest callstack captured for zones and allocations
pub const MAX_CALLSTACK_DEPTH: usize = 62;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

static GLOBAL: RwLock<Option<Arc<Profiler>>> = RwLock::new(None);
/// Bumped on every `init`/`shutdown` so thread caches notice
static GENERATION: AtomicU64 = AtomicU64::new(0);

struct TokenSlot {
    instance: u64,
    owner: Weak<Shared>,
    token: ProducerToken<QueueItem>,
}

thread_local! {
    static CURRENT: RefCell<Option<(u64, Arc<Profiler>)>> = const { RefCell::new(None) };
    static TOKENS: RefCell<Vec<TokenSlot>> = const { RefCell::new(Vec::new()) };
}

/// Telemetry client: a listener, a worker thread and the queues between them
pub struct Profiler {
    shared: Arc<Shared>,
    instance: u64,
    local_addr: Option<SocketAddr>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Profiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profiler")
            .field("instance", &self.instance)
            .field("local_addr", &self.local_addr)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Profiler {
    /// Bind the listener and spawn the worker
    ///
    /// # Errors
    /// `NonMonotonicTimer` unless `no_invariant_check` is set, `Bind` when the
    /// port is taken, `WorkerSpawn` when the thread cannot be created.
    pub fn start(config: Config) -> Result<Arc<Self>, ProfilerError> {
        if !config.no_invariant_check {
            clock::check_monotonic(100_000).map_err(ProfilerError::NonMonotonicTimer)?;
        }
        let addr = config.listen_addr();
        let endpoint =
            TcpEndpoint::bind(addr).map_err(|source| ProfilerError::Bind { addr: addr.to_string(), source })?;
        let listen_port = endpoint.local_addr().map_or(config.port, |a| a.port());

        let broadcaster = if config.broadcast {
            let name = config.program_name.clone().unwrap_or_else(default_program_name);
            Broadcaster::new(config.broadcast_port, listen_port, &name)
                .map_err(|e| warn!("Broadcast disabled: {e}"))
                .ok()
        } else {
            None
        };
        Self::start_with(config, Box::new(endpoint), broadcaster, default_resolver_factory())
    }

    /// Start on a caller-provided listener and symbol resolver
    ///
    /// # Errors
    /// `WorkerSpawn` when the thread cannot be created.
    pub fn start_with(
        config: Config,
        listener: Box<dyn Listener>,
        broadcaster: Option<Broadcaster>,
        resolver: ResolverFactory,
    ) -> Result<Arc<Self>, ProfilerError> {
        let init_begin = clock::now();
        let program_name = config.program_name.clone().unwrap_or_else(default_program_name);
        let local_addr = listener.local_addr();
        let shared = Arc::new(Shared::new(config, ProcessInfo::gather(&program_name, init_begin)));

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("zonetrace-worker".to_string())
            .spawn(move || Worker::new(worker_shared, listener, broadcaster, resolver).run())
            .map_err(ProfilerError::WorkerSpawn)?;

        info!("Profiler started for {program_name}");
        Ok(Arc::new(Self {
            shared,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            local_addr,
            worker: Mutex::new(Some(worker)),
        }))
    }

    /// Address collectors connect to, when listening on a socket
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.local_addr.map(|a| a.port())
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.shared.config()
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.shared.epoch()
    }

    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.epoch().is_connected()
    }

    /// Deliver what is queued (see `Config::no_exit`) and stop the worker
    ///
    /// Idempotent. Events submitted afterwards are not queued.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        self.shared.request_shutdown();
        if worker.join().is_err() {
            warn!("Profiler worker panicked");
        }
        info!("Profiler shut down");
    }

    fn on_demand(&self) -> bool {
        self.shared.config.on_demand
    }

    /// Epoch to stamp a new event with, or `None` when it should not be made
    fn accepting(&self) -> Option<Epoch> {
        if self.shared.shutdown_requested() {
            return None;
        }
        let epoch = self.shared.epoch();
        (!self.on_demand() || epoch.is_connected()).then_some(epoch)
    }

    /// Route one event stamped with `epoch`; nothing is queued once shut down
    fn enqueue(&self, epoch: Epoch, event: Event) {
        if self.shared.shutdown_requested() {
            return;
        }
        let item = QueueItem { epoch: epoch.0, event };
        if item.event.is_serial() {
            self.shared.serial.push(item);
            return;
        }
        self.with_token(move |token| {
            // Only the non-allocating path can fail
            let _ = token.enqueue(item);
        });
    }

    /// Run `f` with this thread's producer token for this instance
    fn with_token<R>(&self, f: impl FnOnce(&mut ProducerToken<QueueItem>) -> R) -> Option<R> {
        TOKENS
            .try_with(|slots| {
                let mut slots = slots.borrow_mut();
                let index = match slots.iter().position(|s| s.instance == self.instance) {
                    Some(index) => index,
                    None => {
                        slots.retain(|s| s.owner.strong_count() > 0);
                        let thread = u64::from(ThreadId::current().0);
                        slots.push(TokenSlot {
                            instance: self.instance,
                            owner: Arc::downgrade(&self.shared),
                            token: self.shared.queue.producer_token(thread),
                        });
                        slots.len() - 1
                    }
                };
                f(&mut slots[index].token)
            })
            .ok()
    }

    /// Submit a transient event built by `make`
    pub(crate) fn submit(&self, make: impl FnOnce() -> Event) {
        if let Some(epoch) = self.accepting() {
            self.enqueue(epoch, make());
        }
    }

    /// Submit an event every collector must see
    ///
    /// In on-demand mode a copy goes to the replay log, and the live copy is
    /// sent only if a collector is attached right now.
    pub(crate) fn submit_deferred(&self, make: impl Fn() -> Event) {
        if self.shared.shutdown_requested() {
            return;
        }
        if !self.on_demand() {
            self.enqueue(self.shared.epoch(), make());
            return;
        }
        let first = make();
        debug_assert_eq!(retention(first.kind()), Retention::Deferred);
        let epoch = self.shared.deferred.defer(ThreadId::current(), first);
        if epoch.is_connected() {
            self.enqueue(epoch, make());
        }
    }

    /// Push several serial events under one lock so they stay adjacent
    fn submit_serial_group(&self, make: impl FnOnce() -> Vec<Event>) {
        let Some(epoch) = self.accepting() else {
            return;
        };
        let events = make();
        let mut guard = self.shared.serial.lock();
        for event in events {
            debug_assert!(event.is_serial());
            guard.push(QueueItem { epoch: epoch.0, event });
        }
    }

    /// Whether an event stamped with `epoch` is still deliverable
    fn still_current(&self, epoch: Epoch) -> bool {
        !self.shared.shutdown_requested() && (!self.on_demand() || self.shared.epoch() == epoch)
    }

    // ------------------------------------------------------------------
    // Zones
    // ------------------------------------------------------------------

    /// Open a zone that ends when the returned guard drops
    pub fn zone(self: &Arc<Self>, srcloc: &'static SourceLocation) -> Zone {
        let Some(epoch) = self.accepting() else {
            return Zone::inactive();
        };
        self.enqueue(epoch, Event::ZoneBegin { time: clock::now(), srcloc });
        Zone::active(Arc::clone(self), epoch)
    }

    /// Open a zone carrying the caller's callstack, up to `depth` frames
    pub fn zone_callstack(self: &Arc<Self>, srcloc: &'static SourceLocation, depth: usize) -> Zone {
        let Some(epoch) = self.accepting() else {
            return Zone::inactive();
        };
        let callstack = capture_callstack(depth);
        self.enqueue(epoch, Event::ZoneBeginCallstack { time: clock::now(), srcloc, callstack });
        Zone::active(Arc::clone(self), epoch)
    }

    /// Open a zone whose location is only known at runtime
    pub fn zone_dynamic(self: &Arc<Self>, srcloc: &crate::event::DynamicSourceLocation) -> Zone {
        let Some(epoch) = self.accepting() else {
            return Zone::inactive();
        };
        self.enqueue(epoch, Event::ZoneBeginAllocSrcLoc { time: clock::now(), srcloc: srcloc.to_payload() });
        Zone::active(Arc::clone(self), epoch)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    pub fn message(&self, text: &str) {
        self.submit(|| Event::Message { time: clock::now(), text: Payload::from(text) });
    }

    pub fn message_color(&self, text: &str, color: u32) {
        self.submit(|| Event::MessageColor { time: clock::now(), text: Payload::from(text), color });
    }

    /// Message whose text is sent once, by address
    pub fn message_literal(&self, text: &'static str) {
        self.submit(|| Event::MessageLiteral { time: clock::now(), text });
    }

    pub fn message_literal_color(&self, text: &'static str, color: u32) {
        self.submit(|| Event::MessageLiteralColor { time: clock::now(), text, color });
    }

    /// Describe the application; shown by every collector that ever attaches
    pub fn app_info(&self, text: &str) {
        let time = clock::now();
        self.submit_deferred(|| Event::MessageAppInfo { time, text: Payload::from(text) });
    }

    // ------------------------------------------------------------------
    // Frames and plots
    // ------------------------------------------------------------------

    /// End of the main frame
    pub fn frame_mark(&self) {
        self.shared.frames.fetch_add(1, Ordering::Relaxed);
        self.submit(|| Event::FrameMark { time: clock::now(), name: None });
    }

    /// End of a secondary continuous frame set
    pub fn frame_mark_named(&self, name: &'static str) {
        self.submit(|| Event::FrameMark { time: clock::now(), name: Some(name) });
    }

    /// Start of a discontinuous frame
    pub fn frame_mark_start(&self, name: &'static str) {
        self.submit(|| Event::FrameMarkStart { time: clock::now(), name });
    }

    pub fn frame_mark_end(&self, name: &'static str) {
        self.submit(|| Event::FrameMarkEnd { time: clock::now(), name });
    }

    pub fn plot(&self, name: &'static str, value: impl PlotData) {
        self.submit(|| value.into_event(clock::now(), name));
    }

    /// Display settings for a plot
    pub fn plot_config(&self, name: &'static str, format: PlotFormat, step: bool, fill: bool, color: u32) {
        self.submit_deferred(|| Event::PlotConfig { name, format, step, fill, color });
    }

    // ------------------------------------------------------------------
    // Threads and parameters
    // ------------------------------------------------------------------

    /// Name the calling thread for collectors
    pub fn set_thread_name(&self, name: &str) {
        self.shared.thread_names.set(ThreadId::current().0, name);
    }

    /// Declare a tweakable parameter the collector may change
    pub fn parameter_setup(&self, idx: u32, name: &'static str, is_bool: bool, value: i32) {
        self.submit_deferred(|| Event::ParamSetup { idx, name, is_bool, value });
    }

    /// Install the hook invoked when a collector changes a parameter
    pub fn set_parameter_callback(&self, callback: impl Fn(u32, i32) + Send + Sync + 'static) {
        let callback: ParameterCallback = Arc::new(callback);
        *self.shared.parameter.write() = Some(callback);
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    pub fn mem_alloc(&self, ptr: u64, size: u64) {
        let thread = ThreadId::current().0;
        self.submit(|| Event::MemAlloc { time: clock::now(), thread, ptr, size });
    }

    pub fn mem_free(&self, ptr: u64) {
        let thread = ThreadId::current().0;
        self.submit(|| Event::MemFree { time: clock::now(), thread, ptr });
    }

    /// Allocation in a named pool
    pub fn mem_alloc_named(&self, ptr: u64, size: u64, name: &'static str) {
        let thread = ThreadId::current().0;
        self.submit(|| Event::MemAllocNamed { time: clock::now(), thread, ptr, size, name });
    }

    pub fn mem_free_named(&self, ptr: u64, name: &'static str) {
        let thread = ThreadId::current().0;
        self.submit(|| Event::MemFreeNamed { time: clock::now(), thread, ptr, name });
    }

    /// Allocation followed by the callstack that made it
    pub fn mem_alloc_callstack(&self, ptr: u64, size: u64, depth: usize) {
        let thread = ThreadId::current().0;
        self.submit_serial_group(|| {
            let callstack = capture_callstack(depth);
            vec![
                Event::MemAlloc { time: clock::now(), thread, ptr, size },
                Event::CallstackSerial { callstack },
            ]
        });
    }

    pub fn mem_free_callstack(&self, ptr: u64, depth: usize) {
        let thread = ThreadId::current().0;
        self.submit_serial_group(|| {
            let callstack = capture_callstack(depth);
            vec![Event::MemFree { time: clock::now(), thread, ptr }, Event::CallstackSerial { callstack }]
        });
    }

    /// Standalone callstack sample for the calling thread
    pub fn callstack(&self, depth: usize) {
        self.submit(|| Event::Callstack { callstack: capture_callstack(depth) });
    }

    // ------------------------------------------------------------------
    // Scheduler
    // ------------------------------------------------------------------

    /// Context switch reported by a system tracer
    pub fn context_switch(&self, time: i64, old_thread: u32, new_thread: u32, cpu: u8, reason: u8, state: u8) {
        self.submit(|| Event::ContextSwitch { time, old_thread, new_thread, cpu, reason, state });
    }

    pub fn thread_wakeup(&self, time: i64, thread: u32) {
        self.submit(|| Event::ThreadWakeup { time, thread });
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Value types a plot accepts
pub trait PlotData: Copy {
    fn into_event(self, time: i64, name: &'static str) -> Event;
}

impl PlotData for i64 {
    fn into_event(self, time: i64, name: &'static str) -> Event {
        Event::PlotInt { time, name, value: self }
    }
}

impl PlotData for f32 {
    fn into_event(self, time: i64, name: &'static str) -> Event {
        Event::PlotFloat { time, name, value: self }
    }
}

impl PlotData for f64 {
    fn into_event(self, time: i64, name: &'static str) -> Event {
        Event::PlotDouble { time, name, value: self }
    }
}

/// Return addresses of the caller, innermost first
fn capture_callstack(depth: usize) -> Payload {
    let depth = depth.min(MAX_CALLSTACK_DEPTH);
    if depth == 0 {
        return Payload::callstack(&[]);
    }
    let mut frames = Vec::with_capacity(depth);
    // the first frame is this function
    let mut skip = 1;
    backtrace::trace(|frame| {
        if skip > 0 {
            skip -= 1;
        } else {
            frames.push(frame.ip() as usize as u64);
        }
        frames.len() < depth
    });
    Payload::callstack(&frames)
}

// ============================================================================
// Process-wide instance
// ============================================================================

/// Start the process-wide profiler
///
/// # Errors
/// `AlreadyInitialized` if one is running; otherwise as [`Profiler::start`].
pub fn init(config: Config) -> Result<Arc<Profiler>, ProfilerError> {
    let mut global = GLOBAL.write();
    if global.is_some() {
        return Err(ProfilerError::AlreadyInitialized);
    }
    let profiler = Profiler::start(config)?;
    *global = Some(Arc::clone(&profiler));
    GENERATION.fetch_add(1, Ordering::Release);
    Ok(profiler)
}

/// Stop the process-wide profiler, delivering what it can first
pub fn shutdown() {
    let profiler = GLOBAL.write().take();
    GENERATION.fetch_add(1, Ordering::Release);
    if let Some(profiler) = profiler {
        profiler.shutdown();
    }
}

/// The process-wide profiler, if one is running
#[must_use]
pub fn current() -> Option<Arc<Profiler>> {
    let generation = GENERATION.load(Ordering::Acquire);
    CURRENT
        .try_with(|cache| {
            let mut cache = cache.borrow_mut();
            if cache.as_ref().map(|(g, _)| *g) != Some(generation) {
                *cache = GLOBAL.read().as_ref().map(|p| (generation, Arc::clone(p)));
            }
            cache.as_ref().map(|(_, p)| Arc::clone(p))
        })
        .ok()
        .flatten()
}

/// Open a zone on the process-wide profiler; inactive when there is none
pub fn zone(srcloc: &'static SourceLocation) -> Zone {
    current().map_or_else(Zone::inactive, |p| p.zone(srcloc))
}

pub fn zone_callstack(srcloc: &'static SourceLocation, depth: usize) -> Zone {
    current().map_or_else(Zone::inactive, |p| p.zone_callstack(srcloc, depth))
}

pub fn message(text: &str) {
    if let Some(p) = current() {
        p.message(text);
    }
}

pub fn message_color(text: &str, color: u32) {
    if let Some(p) = current() {
        p.message_color(text, color);
    }
}

pub fn message_literal(text: &'static str) {
    if let Some(p) = current() {
        p.message_literal(text);
    }
}

pub fn app_info(text: &str) {
    if let Some(p) = current() {
        p.app_info(text);
    }
}

pub fn frame_mark() {
    if let Some(p) = current() {
        p.frame_mark();
    }
}

pub fn frame_mark_named(name: &'static str) {
    if let Some(p) = current() {
        p.frame_mark_named(name);
    }
}

pub fn plot(name: &'static str, value: impl PlotData) {
    if let Some(p) = current() {
        p.plot(name, value);
    }
}

pub fn set_thread_name(name: &str) {
    if let Some(p) = current() {
        p.set_thread_name(name);
    }
}

pub fn mem_alloc(ptr: u64, size: u64) {
    if let Some(p) = current() {
        p.mem_alloc(ptr, size);
    }
}

pub fn mem_free(ptr: u64) {
    if let Some(p) = current() {
        p.mem_free(ptr);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::symbolization::{BacktraceResolver, SymbolResolver};
    use crate::queue::DequeueSink;
    use crate::transport::mock::MemoryListener;

    static LOC: SourceLocation =
        SourceLocation { name: Some("tick"), function: "app::tick", file: "app.rs", line: 9, color: 0 };

    /// A profiler on an in-memory listener nobody connects to
    pub(crate) fn idle_profiler(config: Config) -> Arc<Profiler> {
        let resolver: ResolverFactory = Box::new(|| Box::new(BacktraceResolver) as Box<dyn SymbolResolver>);
        Profiler::start_with(config, Box::new(MemoryListener::default()), None, resolver).unwrap()
    }

    #[derive(Default)]
    struct Collect {
        thread: u32,
        events: Vec<(u32, Event)>,
    }

    impl DequeueSink<QueueItem> for Collect {
        fn thread(&mut self, thread_id: u64) {
            self.thread = u32::try_from(thread_id).unwrap();
        }

        fn item(&mut self, item: QueueItem) {
            self.events.push((self.thread, item.event));
        }
    }

    pub(crate) fn drain_events(profiler: &Profiler) -> Vec<(u32, Event)> {
        let mut consumer = profiler.shared.queue.consumer_token();
        let mut sink = Collect::default();
        profiler.shared.queue.try_dequeue_bulk(&mut consumer, usize::MAX, &mut sink);
        sink.events
    }

    #[test]
    fn test_zone_begin_and_end_are_queued_for_this_thread() {
        let profiler = idle_profiler(Config::local_ephemeral());
        {
            let zone = profiler.zone(&LOC);
            assert!(zone.is_active());
            zone.text("loading");
        }
        let events = drain_events(&profiler);
        let me = ThreadId::current().0;
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|(t, _)| *t == me));
        assert!(matches!(events[0].1, Event::ZoneBegin { .. }));
        assert!(matches!(events[1].1, Event::ZoneText { .. }));
        assert!(matches!(events[2].1, Event::ZoneEnd { .. }));
        profiler.shutdown();
    }

    #[test]
    fn test_on_demand_without_collector_makes_nothing_but_keeps_deferred() {
        let profiler = idle_profiler(Config { on_demand: true, ..Config::local_ephemeral() });
        assert!(!profiler.zone(&LOC).is_active());
        profiler.message("dropped");
        profiler.app_info("v1.2");
        profiler.plot_config("fps", PlotFormat::Number, false, true, 0);

        assert!(drain_events(&profiler).is_empty());
        assert_eq!(profiler.shared.deferred.len(), 2);
        profiler.shutdown();
    }

    #[test]
    fn test_serial_events_bypass_thread_queue() {
        let profiler = idle_profiler(Config::local_ephemeral());
        profiler.mem_alloc_callstack(0x1000, 64, 8);
        profiler.mem_free(0x1000);
        assert!(drain_events(&profiler).is_empty());

        let mut batch = Vec::new();
        profiler.shared.serial.swap(&mut batch);
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch[0].event, Event::MemAlloc { ptr: 0x1000, size: 64, .. }));
        assert!(matches!(batch[1].event, Event::CallstackSerial { .. }));
        assert!(matches!(batch[2].event, Event::MemFree { ptr: 0x1000, .. }));
        profiler.shutdown();
    }

    #[test]
    fn test_frame_marks_are_counted() {
        let profiler = idle_profiler(Config::local_ephemeral());
        profiler.frame_mark();
        profiler.frame_mark();
        profiler.frame_mark_named("physics");
        assert_eq!(profiler.shared.frames.load(Ordering::Relaxed), 2);
        assert_eq!(drain_events(&profiler).len(), 3);
        profiler.shutdown();
    }

    #[test]
    fn test_tokens_are_per_instance() {
        let first = idle_profiler(Config::local_ephemeral());
        let second = idle_profiler(Config::local_ephemeral());
        first.message("a");
        second.message("b");
        second.message("c");
        assert_eq!(drain_events(&first).len(), 1);
        assert_eq!(drain_events(&second).len(), 2);
        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn test_callstack_capture_is_bounded() {
        let payload = capture_callstack(4);
        assert!(payload.len() <= 4 * 8);
        assert_eq!(payload.len() % 8, 0);
        assert!(capture_callstack(1000).len() <= MAX_CALLSTACK_DEPTH * 8);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let profiler = idle_profiler(Config::local_ephemeral());
        profiler.shutdown();
        profiler.shutdown();
        assert_eq!(profiler.worker_state(), WorkerState::Terminated);
    }

    #[test]
    fn test_events_after_shutdown_are_not_queued() {
        let profiler = idle_profiler(Config::local_ephemeral());
        let zone = profiler.zone(&LOC);
        assert!(zone.is_active());
        drain_events(&profiler);
        profiler.shutdown();
        let logged = profiler.shared.deferred.len();

        drop(zone);
        assert!(!profiler.zone(&LOC).is_active());
        for i in 0..10_000u64 {
            profiler.message("late");
            profiler.mem_alloc(0x1000 + i, 16);
        }
        profiler.app_info("late");

        assert_eq!(profiler.shared.queue.size_approx(), 0);
        assert!(profiler.shared.serial.is_empty());
        assert_eq!(profiler.shared.deferred.len(), logged);
    }
}
