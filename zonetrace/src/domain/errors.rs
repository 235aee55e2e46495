//! Structured error types for zonetrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;
use zonetrace_common::HandshakeStatus;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("No block available without heap allocation")]
    NoBlockAvailable,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown handshake status {0}")]
    UnknownStatus(u8),

    #[error("Unknown record tag {0}")]
    UnknownRecord(u8),

    #[error("Record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Payload blob {id} missing after its record")]
    MissingPayload { id: u64 },

    #[error("Frame declares {0} bytes uncompressed, over the limit")]
    FrameTooLarge(usize),

    #[error("Decompression failed: {0}")]
    Codec(String),
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Handshake rejected: {0:?}")]
    Handshake(HandshakeStatus),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Profiler already initialized")]
    AlreadyInitialized,

    #[error("Failed to listen on {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(std::io::Error),

    #[error("Timer is not monotonic (went back {0} ns); set ZONETRACE_NO_INVARIANT_CHECK=1 to ignore")]
    NonMonotonicTimer(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::Truncated { needed: 8, available: 3 };
        assert_eq!(err.to_string(), "Record truncated: needed 8 bytes, 3 available");
    }

    #[test]
    fn test_capture_error_wraps_protocol() {
        let err: CaptureError = ProtocolError::UnknownRecord(250).into();
        assert!(err.to_string().contains("250"));
    }

    #[test]
    fn test_bind_error_mentions_address() {
        let err = ProfilerError::Bind {
            addr: "0.0.0.0:8086".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().contains("0.0.0.0:8086"));
    }
}
