//! The worker thread
//!
//! One thread owns everything on the consumer side: the consumer token, the
//! frame buffer, the reference times, the query registry and the socket.
//! Producers only ever touch [`Shared`].
//!
//! ```text
//!                  ┌──────────── shutdown requested ─────────────┐
//!                  ▼                                             │
//!  WaitingForHandshake ──Welcome──▶ Connected ──error/Disconnect──▶ Draining
//!          ▲                           │                            │
//!          └───────────────────────────┼────────────────────────────┘
//!                                      ▼
//!                               ShuttingDown ──▶ Terminated
//! ```
//!
//! A session's frame buffer and encoder live in [`Session`] and die with
//! it, so a collector never sees fragments built for its predecessor.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::RwLock;
use zonetrace_common::{
    HandshakeStatus, OnDemandPayload, ServerQuery, WELCOME_FLAG_CODE_TRANSFER, WELCOME_FLAG_IS_APPLE,
    WELCOME_FLAG_ON_DEMAND,
};

use crate::clock;
use crate::config::Config;
use crate::deferred::DeferredQueue;
use crate::domain::{Epoch, ThreadId, TransportError};
use crate::event::{Event, QueueItem};
use crate::frame::{encode_frame, Codec, FrameBuffer, Lz4Codec};
use crate::handshake::{perform_handshake, ProcessInfo};
use crate::query::{ParameterCallback, QueryContext, QueryOutcome, QueryServer, Registry, ThreadNames};
use crate::queue::{ConcurrentQueue, ConsumerToken, DequeueSink};
use crate::serial::SerialQueue;
use crate::symbolization::ResolverFactory;
use crate::transport::broadcast::ACTIVE_TIME_CONNECTED;
use crate::transport::{Broadcaster, Connection, Listener};
use crate::wire::RecordEncoder;

/// How long `accept` blocks per waiting iteration
const ACCEPT_TIMEOUT: Duration = Duration::from_millis(10);

/// Time allowed for the rest of a query once its first byte is readable
const QUERY_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Worker lifecycle, readable from any thread
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    WaitingForHandshake = 0,
    Connected = 1,
    Draining = 2,
    ShuttingDown = 3,
    Terminated = 4,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::WaitingForHandshake,
            1 => Self::Connected,
            2 => Self::Draining,
            3 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

/// State shared between producers and the worker
pub struct Shared {
    pub(crate) config: Config,
    pub(crate) queue: Arc<ConcurrentQueue<QueueItem>>,
    pub(crate) serial: SerialQueue<QueueItem>,
    pub(crate) deferred: DeferredQueue,
    pub(crate) thread_names: ThreadNames,
    pub(crate) parameter: RwLock<Option<ParameterCallback>>,
    /// Frame marks so far, reported to on-demand collectors
    pub(crate) frames: AtomicU64,
    pub(crate) process_info: ProcessInfo,
    shutdown: AtomicBool,
    state: AtomicU8,
}

impl Shared {
    #[must_use]
    pub fn new(config: Config, process_info: ProcessInfo) -> Self {
        Self {
            queue: Arc::new(ConcurrentQueue::new(config.initial_blocks)),
            serial: SerialQueue::new(),
            deferred: DeferredQueue::new(),
            thread_names: ThreadNames::default(),
            parameter: RwLock::new(None),
            frames: AtomicU64::new(0),
            process_info,
            shutdown: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::WaitingForHandshake as u8),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            debug!("Worker {:?} -> {state:?}", WorkerState::from_u8(previous));
        }
    }

    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.deferred.epoch()
    }

    /// Ask the worker to finish; it notices between iterations
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Thread attached to an event on the wire, `None` for serial events
fn wire_thread(event: &Event, thread: ThreadId) -> Option<u32> {
    (!event.is_serial()).then_some(thread.0)
}

fn send_frame(codec: &mut dyn Codec, conn: &mut dyn Connection, frame: &[u8]) -> Result<(), TransportError> {
    conn.send(&encode_frame(codec, frame))
}

/// One collector connection and everything serialized for it
struct Session {
    conn: Box<dyn Connection>,
    frame: FrameBuffer,
    encoder: RecordEncoder,
    /// Record being built; appended to the frame as a unit
    scratch: Vec<u8>,
    thread: Option<u32>,
    last_send: Instant,
}

impl Session {
    fn new(conn: Box<dyn Connection>, frame_target: usize) -> Self {
        Self {
            conn,
            frame: FrameBuffer::new(frame_target),
            encoder: RecordEncoder::new(),
            scratch: Vec::with_capacity(256),
            thread: None,
            last_send: Instant::now(),
        }
    }

    /// Serialize `event` into the scratch record, switching thread context first if needed
    fn stage(&mut self, thread: Option<u32>, event: &Event) {
        self.scratch.clear();
        if let Some(thread) = thread.filter(|t| self.thread != Some(*t)) {
            self.encoder.thread_context(thread, &mut self.scratch);
            self.thread = Some(thread);
        }
        self.encoder.encode(event, &mut self.scratch);
    }

    /// Move the scratch record into the frame
    fn push(&mut self, codec: &mut dyn Codec) -> Result<(), TransportError> {
        let Self { conn, frame, scratch, last_send, .. } = self;
        frame.append(&scratch[..], |bytes| {
            *last_send = Instant::now();
            send_frame(codec, conn.as_mut(), bytes)
        })
    }

    fn flush(&mut self, codec: &mut dyn Codec) -> Result<(), TransportError> {
        let Self { conn, frame, last_send, .. } = self;
        frame.complete(|bytes| {
            *last_send = Instant::now();
            send_frame(codec, conn.as_mut(), bytes)
        })
    }

    /// Push prebuilt records and send them
    fn push_all(&mut self, codec: &mut dyn Codec, records: Vec<Vec<u8>>) -> Result<(), TransportError> {
        for record in records {
            self.scratch = record;
            self.push(codec)?;
        }
        self.flush(codec)
    }

    fn keep_alive(&mut self, codec: &mut dyn Codec) -> Result<(), TransportError> {
        self.scratch.clear();
        self.encoder.keep_alive(&mut self.scratch);
        self.push(codec)?;
        self.flush(codec)
    }

    fn terminate(&mut self, codec: &mut dyn Codec) -> Result<(), TransportError> {
        self.scratch.clear();
        self.encoder.terminate(&mut self.scratch);
        self.push(codec)?;
        self.flush(codec)
    }
}

/// Serializes dequeued items into the session
///
/// After the first transport error the rest of the batch is dropped.
struct DrainSink<'a> {
    session: &'a mut Session,
    codec: &'a mut dyn Codec,
    registry: &'a mut Registry,
    /// Only this epoch is delivered, when set
    epoch: Option<u32>,
    thread: u32,
    written: usize,
    error: Option<TransportError>,
}

impl DrainSink<'_> {
    fn write(&mut self, thread: Option<u32>, item: &QueueItem) {
        if self.error.is_some() || self.epoch.is_some_and(|e| e != item.epoch) {
            return;
        }
        self.registry.register_event(&item.event);
        self.session.stage(thread, &item.event);
        match self.session.push(self.codec) {
            Ok(()) => self.written += 1,
            Err(e) => self.error = Some(e),
        }
    }

    fn finish(self) -> Result<usize, TransportError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.written),
        }
    }
}

impl DequeueSink<QueueItem> for DrainSink<'_> {
    fn thread(&mut self, thread_id: u64) {
        self.thread = u32::try_from(thread_id).unwrap_or(u32::MAX);
    }

    fn item(&mut self, item: QueueItem) {
        let thread = self.thread;
        self.write(Some(thread), &item);
    }
}

enum SessionEnd {
    /// Collector left or the connection failed
    Lost,
    Shutdown,
}

/// Consumer side of the pipeline; see the module docs
pub struct Worker {
    shared: Arc<Shared>,
    listener: Box<dyn Listener>,
    broadcaster: Option<Broadcaster>,
    last_broadcast: Option<Instant>,
    queries: QueryServer,
    codec: Box<dyn Codec>,
    consumer: ConsumerToken,
    serial_batch: Vec<QueueItem>,
    started: Instant,
}

impl Worker {
    #[must_use]
    pub fn new(
        shared: Arc<Shared>,
        listener: Box<dyn Listener>,
        broadcaster: Option<Broadcaster>,
        resolver: ResolverFactory,
    ) -> Self {
        let queries = QueryServer::new(resolver, shared.config.code_transfer);
        let consumer = shared.queue.consumer_token();
        Self {
            shared,
            listener,
            broadcaster,
            last_broadcast: None,
            queries,
            codec: Box::new(Lz4Codec),
            consumer,
            serial_batch: Vec::new(),
            started: Instant::now(),
        }
    }

    /// Serve collectors until shutdown is requested
    pub fn run(mut self) {
        while !self.shared.shutdown_requested() {
            self.shared.set_state(WorkerState::WaitingForHandshake);
            if self.shared.config.on_demand {
                self.clear_queues();
            }
            let Some(mut session) = self.wait_for_collector() else {
                continue;
            };
            match self.serve(&mut session) {
                SessionEnd::Lost => self.end_session(session),
                SessionEnd::Shutdown => {
                    self.shut_down(Some(session));
                    return;
                }
            }
        }
        self.shut_down(None);
    }

    fn clear_queues(&mut self) {
        let dropped = self.shared.queue.clear(&mut self.consumer) + self.shared.serial.clear();
        if dropped > 0 {
            debug!("Dropped {dropped} events recorded without a collector");
        }
    }

    fn broadcast(&mut self, active_time: i32) {
        let Some(broadcaster) = &mut self.broadcaster else {
            return;
        };
        if let Err(e) = broadcaster.send(active_time) {
            debug!("Broadcast failed: {e}");
        }
        self.last_broadcast = Some(Instant::now());
    }

    /// One accept round; a session when a collector was welcomed
    fn wait_for_collector(&mut self) -> Option<Session> {
        let interval = self.shared.config.broadcast_interval;
        if self.last_broadcast.is_none_or(|at| at.elapsed() >= interval) {
            let active = i32::try_from(self.started.elapsed().as_secs()).unwrap_or(i32::MAX);
            self.broadcast(active);
        }

        let mut conn = match self.listener.accept(ACCEPT_TIMEOUT) {
            Ok(Some(conn)) => conn,
            Ok(None) => return None,
            Err(e) => {
                warn!("Accept failed: {e}");
                std::thread::sleep(self.shared.config.idle_sleep);
                return None;
            }
        };
        match perform_handshake(conn.as_mut(), false) {
            Ok(Some(HandshakeStatus::Welcome)) => {}
            Ok(_) => return None,
            Err(e) => {
                warn!("Handshake failed: {e}");
                return None;
            }
        }
        match self.start_session(conn) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Collector lost during session start: {e}");
                None
            }
        }
    }

    fn welcome_flags(config: &Config) -> u8 {
        let mut flags = 0;
        if config.on_demand {
            flags |= WELCOME_FLAG_ON_DEMAND;
        }
        if config.code_transfer {
            flags |= WELCOME_FLAG_CODE_TRANSFER;
        }
        if cfg!(target_vendor = "apple") {
            flags |= WELCOME_FLAG_IS_APPLE;
        }
        flags
    }

    /// Welcome the collector, then open the epoch and replay the deferred log
    fn start_session(&mut self, mut conn: Box<dyn Connection>) -> Result<Session, TransportError> {
        let config = &self.shared.config;
        let welcome = self.shared.process_info.welcome(Self::welcome_flags(config));
        conn.send(&welcome.to_bytes())?;
        if config.on_demand {
            let payload = OnDemandPayload {
                frames: self.shared.frames.load(Ordering::Relaxed),
                current_time: clock::now(),
            };
            conn.send(&payload.to_bytes())?;
        }

        let mut session = Session::new(conn, config.frame_target_size);
        let mut replay = Vec::new();
        let registry = self.queries.registry();
        let epoch = self.shared.deferred.bump_and_replay(|thread, event| {
            registry.register_event(event);
            session.stage(wire_thread(event, thread), event);
            replay.push(std::mem::take(&mut session.scratch));
        });

        if let Err(e) = session.push_all(self.codec.as_mut(), replay) {
            self.shared.deferred.bump();
            return Err(e);
        }

        self.broadcast(ACTIVE_TIME_CONNECTED);
        info!("Collector session started (epoch {epoch})");
        Ok(session)
    }

    fn serve(&mut self, session: &mut Session) -> SessionEnd {
        self.shared.set_state(WorkerState::Connected);
        loop {
            match self.iterate(session) {
                Ok(None) => {}
                Ok(Some(end)) => return end,
                Err(e) => {
                    warn!("Collector connection lost: {e}");
                    return SessionEnd::Lost;
                }
            }
        }
    }

    /// One connected iteration; `Some` when the session is over
    fn iterate(&mut self, session: &mut Session) -> Result<Option<SessionEnd>, TransportError> {
        let written = self.drain(session)?;
        if written > 0 {
            session.flush(self.codec.as_mut())?;
        } else {
            if self.shared.shutdown_requested() {
                return Ok(Some(SessionEnd::Shutdown));
            }
            if !session.conn.has_data()? {
                std::thread::sleep(self.shared.config.idle_sleep);
            }
            if session.last_send.elapsed() >= self.shared.config.keep_alive_interval {
                session.keep_alive(self.codec.as_mut())?;
            }
        }

        match self.service_queries(session)? {
            QueryOutcome::Continue => Ok(None),
            QueryOutcome::Disconnect | QueryOutcome::Terminate => {
                info!("Collector disconnected");
                Ok(Some(SessionEnd::Lost))
            }
        }
    }

    /// Move one batch from the thread queue and everything from the serial queue
    fn drain(&mut self, session: &mut Session) -> Result<usize, TransportError> {
        let epoch = self.shared.config.on_demand.then(|| self.shared.deferred.epoch().0);
        let mut sink = DrainSink {
            session,
            codec: self.codec.as_mut(),
            registry: self.queries.registry(),
            epoch,
            thread: 0,
            written: 0,
            error: None,
        };
        self.shared.queue.try_dequeue_bulk(&mut self.consumer, self.shared.config.batch_limit, &mut sink);

        self.shared.serial.swap(&mut self.serial_batch);
        for item in self.serial_batch.drain(..) {
            sink.write(None, &item);
        }
        sink.finish()
    }

    /// Answer up to `query_quota` queries that are already waiting
    fn service_queries(&mut self, session: &mut Session) -> Result<QueryOutcome, TransportError> {
        let codec = self.codec.as_mut();
        let mut outcome = QueryOutcome::Continue;
        for _ in 0..self.shared.config.query_quota {
            if !session.conn.has_data()? {
                break;
            }
            let mut packet = [0u8; ServerQuery::SIZE];
            session.conn.recv_exact(&mut packet, QUERY_READ_TIMEOUT)?;

            let ctx = QueryContext {
                thread_names: &self.shared.thread_names,
                parameter: self.shared.parameter.read().clone(),
            };
            session.scratch.clear();
            outcome =
                self.queries.service(ServerQuery::from_bytes(&packet), &ctx, &mut session.encoder, &mut session.scratch);
            if !session.scratch.is_empty() {
                session.push(codec)?;
            }
            if outcome != QueryOutcome::Continue {
                break;
            }
        }
        session.flush(codec)?;
        Ok(outcome)
    }

    fn end_session(&mut self, session: Session) {
        self.shared.set_state(WorkerState::Draining);
        let epoch = self.shared.deferred.bump();
        drop(session);
        if self.shared.config.on_demand {
            self.clear_queues();
        }
        info!("Collector session ended (epoch {epoch})");
    }

    fn shut_down(&mut self, session: Option<Session>) {
        self.shared.set_state(WorkerState::ShuttingDown);
        let session = session.or_else(|| {
            if !self.shared.config.no_exit {
                return None;
            }
            info!("Waiting for a collector to take the remaining data");
            loop {
                if let Some(session) = self.wait_for_collector() {
                    break Some(session);
                }
            }
        });

        if let Some(mut session) = session {
            match self.finish_session(&mut session) {
                Ok(()) => info!("Collector received all data"),
                Err(e) => warn!("Collector lost during shutdown: {e}"),
            }
            self.shared.deferred.bump();
        }
        self.shared.set_state(WorkerState::Terminated);
        info!("Profiler worker stopped");
    }

    /// Deliver everything, say goodbye and wait for the collector to acknowledge
    fn finish_session(&mut self, session: &mut Session) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        loop {
            let written = self.drain(session)?;
            let empty = self.shared.queue.size_approx() == 0 && self.shared.serial.is_empty();
            if (written == 0 && empty) || Instant::now() >= deadline {
                break;
            }
        }
        session.flush(self.codec.as_mut())?;
        session.terminate(self.codec.as_mut())?;

        while Instant::now() < deadline {
            self.turn_away_newcomer();
            match self.service_queries(session) {
                Ok(QueryOutcome::Continue) => {}
                Ok(_) | Err(TransportError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
            if !session.conn.has_data()? {
                std::thread::sleep(self.shared.config.idle_sleep);
            }
        }
        debug!("Collector did not acknowledge termination in time");
        Ok(())
    }

    fn turn_away_newcomer(&mut self) {
        if let Ok(Some(mut conn)) = self.listener.accept(Duration::ZERO) {
            if let Err(e) = perform_handshake(conn.as_mut(), true) {
                debug!("Late collector went away: {e}");
            }
        }
    }
}
