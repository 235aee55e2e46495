//! Domain model for zonetrace
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time separation of thread ids, process ids and connection epochs
//! - Structured error handling for the queue, transport, protocol and collector layers

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Epoch, Pid, ThreadId};

pub use errors::{CaptureError, ProfilerError, ProtocolError, QueueError, TransportError};
