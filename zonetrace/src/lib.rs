//! # zonetrace - In-process Telemetry Client
//!
//! zonetrace records zones, messages, frame marks, plots, lock contention,
//! memory events and GPU timings from inside an application and streams them
//! to a collector over TCP. Producers only write into lock-free per-thread
//! queues; a single background worker serializes, delta-encodes and
//! LZ4-compresses the stream and answers the collector's queries.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Instrumented Application                    │
//! │        zone!() / message!() / frame_mark!() / TracedMutex       │
//! └──────────┬───────────────────────┬───────────────────┬──────────┘
//!            │ per-thread            │ ordered           │ replayed
//!            ▼                       ▼                   ▼
//!   ┌─────────────────┐    ┌──────────────────┐  ┌────────────────┐
//!   │  queue (MPMC)   │    │  serial (mutex)  │  │  deferred log  │
//!   └────────┬────────┘    └────────┬─────────┘  └───────┬────────┘
//!            └──────────────┬───────┴────────────────────┘
//!                           ▼
//!              ┌──────────────────────────┐
//!              │  dispatcher (worker)     │  wire + timeline + frame
//!              │  handshake / query       │◀──── collector queries
//!              └────────────┬─────────────┘
//!                           │ u32 length + LZ4 block
//!                           ▼
//!              ┌──────────────────────────┐
//!              │  capture (collector)     │──▶ export (trace.json)
//!              └──────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Client side
//!
//! - [`profiler`]: process-wide lifecycle ([`init`], [`shutdown`]) and the
//!   instrumentation API, including zone guards, lock wrappers and GPU contexts
//! - [`queue`]: block-based MPMC queue with per-producer tokens
//! - [`serial`] and [`deferred`]: the ordered queue and the replayed log
//! - [`dispatcher`]: the worker state machine driving sessions
//! - [`handshake`] and [`query`]: connection admission and query answers
//! - [`symbolization`]: DWARF resolution for callstack frame queries
//!
//! ### Shared
//!
//! - [`event`], [`wire`], [`timeline`], [`frame`]: record model and encoding
//! - [`transport`]: connection traits, TCP and discovery broadcast
//! - [`config`], [`domain`], [`clock`]
//!
//! ### Collector side
//!
//! - [`capture`]: handshake, stream decoding and query bookkeeping
//! - [`export`]: Chrome Trace Event Format JSON
//! - [`cli`]: `zonetrace-capture` arguments
//!
//! ## Typical Usage
//!
//! ```ignore
//! let _profiler = zonetrace::init(zonetrace::Config::from_env())?;
//! loop {
//!     let _zone = zonetrace::zone!("update");
//!     zonetrace::plot!("entities", world.len() as i64);
//!     zonetrace::frame_mark!();
//! }
//! ```
//!
//! ```bash
//! # Capture until the application exits and write a Chrome trace
//! zonetrace-capture --export trace.json
//! ```

pub mod capture;
pub mod cli;
pub mod clock;
pub mod config;
pub mod deferred;
pub mod dispatcher;
pub mod domain;
pub mod event;
pub mod export;
pub mod frame;
pub mod handshake;
pub mod preflight;
pub mod profiler;
pub mod query;
pub mod queue;
pub mod serial;
pub mod symbolization;
pub mod timeline;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use event::{DynamicSourceLocation, PlotFormat, SourceLocation};
pub use profiler::gpu::GPU_CONTEXT_CALIBRATION;
pub use profiler::{
    app_info, current, frame_mark, frame_mark_named, init, mem_alloc, mem_free, message, message_color,
    message_literal, plot, set_thread_name, shutdown, zone, zone_callstack, GpuContext, PlotData, Profiler,
    TracedMutex, TracedRwLock, Zone,
};
