//! In-memory peers for exercising the worker without sockets

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Connection, Listener};
use crate::domain::TransportError;

#[derive(Debug, Default)]
pub(crate) struct PipeState {
    /// Bytes the peer has written to us
    pub inbound: VecDeque<u8>,
    /// Everything we sent, in order
    pub sent: Vec<u8>,
    /// Fail every send once this many more have succeeded
    pub fail_sends_after: Option<usize>,
    pub closed: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryConnection(pub Arc<Mutex<PipeState>>);

impl MemoryConnection {
    pub fn with_inbound(bytes: &[u8]) -> Self {
        let conn = Self::default();
        conn.0.lock().inbound.extend(bytes);
        conn
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.0.lock().inbound.extend(bytes);
    }

    pub fn sent(&self) -> Vec<u8> {
        self.0.lock().sent.clone()
    }
}

impl Connection for MemoryConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.0.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        match state.fail_sends_after {
            Some(0) => return Err(TransportError::Io(std::io::ErrorKind::BrokenPipe.into())),
            Some(n) => state.fail_sends_after = Some(n - 1),
            None => {}
        }
        state.sent.extend_from_slice(bytes);
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.0.lock();
        if state.inbound.len() < buf.len() {
            return Err(if state.closed { TransportError::Closed } else { TransportError::Timeout(timeout) });
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn has_data(&mut self) -> Result<bool, TransportError> {
        let state = self.0.lock();
        if state.closed && state.inbound.is_empty() {
            return Err(TransportError::Closed);
        }
        Ok(!state.inbound.is_empty())
    }
}

/// Hands out queued connections one per `accept`
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryListener(pub Arc<Mutex<VecDeque<MemoryConnection>>>);

impl MemoryListener {
    pub fn push(&self, conn: MemoryConnection) {
        self.0.lock().push_back(conn);
    }
}

impl Listener for MemoryListener {
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Connection>>, TransportError> {
        if let Some(conn) = self.0.lock().pop_front() {
            return Ok(Some(Box::new(conn)));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(None)
    }

    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recv_exact_takes_only_what_was_asked() {
        let mut conn = MemoryConnection::with_inbound(b"abcdef");
        let mut buf = [0u8; 4];
        conn.recv_exact(&mut buf, Duration::ZERO).unwrap();
        assert_eq!(&buf, b"abcd");
        assert!(matches!(conn.recv_exact(&mut buf, Duration::ZERO), Err(TransportError::Timeout(_))));

        conn.0.lock().closed = true;
        let mut rest = [0u8; 2];
        conn.recv_exact(&mut rest, Duration::ZERO).unwrap();
        assert_eq!(&rest, b"ef");
        assert!(matches!(conn.has_data(), Err(TransportError::Closed)));
    }
}
