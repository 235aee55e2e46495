//! Socket seam between the worker and the collector
//!
//! The worker only needs four operations: accept a collector, send bytes,
//! read an exact number of bytes with a deadline, and ask whether anything is
//! waiting. [`Listener`] and [`Connection`] capture those so tests can swap in
//! failing or scripted peers; [`TcpEndpoint`] and [`TcpConnection`] are the
//! real thing over `std::net`.
//!
//! All calls are bounded. The worker is a plain thread and must get back to
//! its queues even when the collector stalls.

pub mod broadcast;
#[cfg(test)]
pub(crate) mod mock;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::domain::TransportError;

pub use broadcast::Broadcaster;

/// How long a blocked send may stall the worker
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

const ACCEPT_POLL: Duration = Duration::from_millis(1);

/// One established byte stream
pub trait Connection: Send {
    /// Write all of `bytes`
    ///
    /// # Errors
    /// `Timeout` when the peer stops reading, `Closed` when it went away.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Fill `buf` completely or fail
    ///
    /// # Errors
    /// `Timeout` if `buf` is not full after `timeout`, `Closed` on EOF.
    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError>;

    /// Whether a read would return data right now
    ///
    /// # Errors
    /// `Closed` once the peer has shut its side down.
    fn has_data(&mut self) -> Result<bool, TransportError>;
}

/// Source of incoming collector connections
pub trait Listener: Send {
    /// Wait up to `timeout` for a collector
    ///
    /// # Errors
    /// Socket errors other than "nothing yet".
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Connection>>, TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;
}

fn classify(err: std::io::Error, timeout: Duration) -> TransportError {
    match err.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::Timeout(timeout),
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

/// [`Connection`] over a blocking TCP stream
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    send_timeout: Duration,
}

impl TcpConnection {
    /// Wrap an accepted or connected stream
    ///
    /// # Errors
    /// When socket options cannot be applied.
    pub fn new(stream: TcpStream) -> Result<Self, TransportError> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, send_timeout: SEND_TIMEOUT })
    }

    /// Connect to a listening peer
    ///
    /// # Errors
    /// `Timeout` when no address answered in time, `Io` otherwise.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, TransportError> {
        let mut last = TransportError::Closed;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, timeout) {
                Ok(stream) => return Self::new(stream),
                Err(e) => last = classify(e, timeout),
            }
        }
        Err(last)
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Close both directions
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.set_write_timeout(Some(self.send_timeout))?;
        self.stream.write_all(bytes).map_err(|e| classify(e, self.send_timeout))
    }

    fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), TransportError> {
        // A zero read timeout means "block forever" to the OS
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        self.stream.read_exact(buf).map_err(|e| classify(e, timeout))
    }

    fn has_data(&mut self) -> Result<bool, TransportError> {
        let mut byte = [0u8; 1];
        self.stream.set_nonblocking(true)?;
        let peeked = self.stream.peek(&mut byte);
        self.stream.set_nonblocking(false)?;
        match peeked {
            Ok(0) => Err(TransportError::Closed),
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(classify(e, Duration::ZERO)),
        }
    }
}

/// [`Listener`] over a non-blocking TCP socket
#[derive(Debug)]
pub struct TcpEndpoint {
    listener: TcpListener,
}

impl TcpEndpoint {
    /// Bind and start listening; port 0 picks a free port
    ///
    /// # Errors
    /// When the address is in use or cannot be bound.
    pub fn bind(addr: impl ToSocketAddrs) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        if let Ok(local) = listener.local_addr() {
            info!("Listening for collectors on {local}");
        }
        Ok(Self { listener })
    }
}

impl Listener for TcpEndpoint {
    fn accept(&mut self, timeout: Duration) -> Result<Option<Box<dyn Connection>>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Collector connected from {peer}");
                    return Ok(Some(Box::new(TcpConnection::new(stream)?)));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL.min(deadline - now));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}
