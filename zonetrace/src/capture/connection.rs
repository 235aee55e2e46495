//! Collector end of the socket: handshake, frames and queries

use std::net::ToSocketAddrs;
use std::time::{Duration, Instant};

use log::{debug, info};
use zonetrace_common::{
    trim_padded, HandshakeStatus, OnDemandPayload, ServerQuery, WelcomeMessage, FRAME_HEADER_SIZE, PROTOCOL_VERSION,
    SHIBBOLETH,
};

use crate::domain::{CaptureError, ProtocolError, TransportError};
use crate::frame::{Codec, Lz4Codec, MAX_FRAME_SIZE};
use crate::transport::{Connection, TcpConnection};

/// Time allowed for the rest of a frame once its header started arriving
const FRAME_BODY_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A welcomed connection to a client
pub struct CollectorConnection {
    conn: Box<dyn Connection>,
    welcome: WelcomeMessage,
    on_demand: Option<OnDemandPayload>,
    codec: Lz4Codec,
}

impl std::fmt::Debug for CollectorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorConnection")
            .field("program", &self.program_name())
            .field("pid", &self.welcome.pid)
            .field("on_demand", &self.on_demand)
            .finish_non_exhaustive()
    }
}

impl CollectorConnection {
    /// Connect to a client and complete the handshake
    ///
    /// # Errors
    /// `Handshake` with the client's answer when it is not `Welcome`, or with
    /// `Dropped` when it hung up without one; transport errors otherwise.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, CaptureError> {
        let conn = TcpConnection::connect(addr, timeout)?;
        Self::from_connection(Box::new(conn), timeout)
    }

    /// Handshake over an already established connection
    ///
    /// # Errors
    /// Same as [`CollectorConnection::connect`].
    pub fn from_connection(mut conn: Box<dyn Connection>, timeout: Duration) -> Result<Self, CaptureError> {
        let mut greeting = SHIBBOLETH.to_vec();
        greeting.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
        match conn.send(&greeting) {
            Ok(()) => {}
            Err(TransportError::Closed) => return Err(CaptureError::Handshake(HandshakeStatus::Dropped)),
            Err(e) => return Err(e.into()),
        }

        let mut status = [0u8; 1];
        match conn.recv_exact(&mut status, timeout) {
            Ok(()) => {}
            Err(TransportError::Closed) => return Err(CaptureError::Handshake(HandshakeStatus::Dropped)),
            Err(e) => return Err(e.into()),
        }
        let status = HandshakeStatus::from_u8(status[0]).ok_or(ProtocolError::UnknownStatus(status[0]))?;
        if status != HandshakeStatus::Welcome {
            return Err(CaptureError::Handshake(status));
        }

        let mut welcome = [0u8; WelcomeMessage::SIZE];
        conn.recv_exact(&mut welcome, timeout)?;
        let welcome = WelcomeMessage::from_bytes(&welcome);
        let on_demand = if welcome.is_on_demand() {
            let mut payload = [0u8; OnDemandPayload::SIZE];
            conn.recv_exact(&mut payload, timeout)?;
            Some(OnDemandPayload::from_bytes(&payload))
        } else {
            None
        };

        let this = Self { conn, welcome, on_demand, codec: Lz4Codec };
        info!("Connected to {} (pid {})", this.program_name(), this.welcome.pid);
        Ok(this)
    }

    #[must_use]
    pub fn welcome(&self) -> &WelcomeMessage {
        &self.welcome
    }

    /// Present when the client records on demand
    #[must_use]
    pub fn on_demand(&self) -> Option<&OnDemandPayload> {
        self.on_demand.as_ref()
    }

    #[must_use]
    pub fn program_name(&self) -> String {
        String::from_utf8_lossy(trim_padded(&self.welcome.program_name)).into_owned()
    }

    /// Wait up to `timeout` for a frame and return it decompressed
    ///
    /// `Ok(None)` means nothing arrived in time.
    ///
    /// # Errors
    /// `Transport(Closed)` when the client hung up; protocol errors for
    /// oversized or corrupt frames.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, CaptureError> {
        let deadline = Instant::now() + timeout;
        while !self.conn.has_data()? {
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.conn.recv_exact(&mut header, FRAME_BODY_TIMEOUT)?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len).into());
        }
        let mut block = vec![0u8; len];
        self.conn.recv_exact(&mut block, FRAME_BODY_TIMEOUT)?;
        let frame = self.codec.decompress(&block, MAX_FRAME_SIZE)?;
        debug!("Frame: {len} bytes compressed, {} bytes of records", frame.len());
        Ok(Some(frame))
    }

    /// # Errors
    /// Transport failures.
    pub fn send_query(&mut self, query: ServerQuery) -> Result<(), CaptureError> {
        self.conn.send(&query.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::handshake::ProcessInfo;
    use crate::transport::mock::MemoryConnection;
    use zonetrace_common::QueryKind;

    fn welcomed(stream: &[u8]) -> (CollectorConnection, MemoryConnection) {
        let conn = MemoryConnection::with_inbound(stream);
        let collector = CollectorConnection::from_connection(Box::new(conn.clone()), Duration::from_millis(10)).unwrap();
        (collector, conn)
    }

    fn welcome_bytes(flags: u8) -> Vec<u8> {
        let mut bytes = vec![HandshakeStatus::Welcome as u8];
        bytes.extend_from_slice(&ProcessInfo::gather("capture-test", 0).welcome(flags).to_bytes());
        bytes
    }

    #[test]
    fn test_handshake_sends_greeting_and_reads_welcome() {
        let (collector, conn) = welcomed(&welcome_bytes(0));
        assert_eq!(&conn.sent()[..8], &SHIBBOLETH);
        assert_eq!(&conn.sent()[8..], &PROTOCOL_VERSION.to_le_bytes());
        assert_eq!(collector.program_name(), "capture-test");
        assert!(collector.on_demand().is_none());
    }

    #[test]
    fn test_on_demand_payload_follows_welcome() {
        let mut stream = welcome_bytes(zonetrace_common::WELCOME_FLAG_ON_DEMAND);
        stream.extend_from_slice(&OnDemandPayload { frames: 12, current_time: 99 }.to_bytes());
        let (collector, _) = welcomed(&stream);
        assert_eq!(collector.on_demand(), Some(&OnDemandPayload { frames: 12, current_time: 99 }));
    }

    #[test]
    fn test_rejections_and_drops() {
        let conn = MemoryConnection::with_inbound(&[HandshakeStatus::NotAvailable as u8]);
        let err = CollectorConnection::from_connection(Box::new(conn), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CaptureError::Handshake(HandshakeStatus::NotAvailable)));

        let conn = MemoryConnection::default();
        conn.0.lock().closed = true;
        let err = CollectorConnection::from_connection(Box::new(conn), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CaptureError::Handshake(HandshakeStatus::Dropped)));

        let conn = MemoryConnection::with_inbound(&[42]);
        let err = CollectorConnection::from_connection(Box::new(conn), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CaptureError::Protocol(ProtocolError::UnknownStatus(42))));
    }

    #[test]
    fn test_greeting_to_closed_peer_is_a_drop() {
        let conn = MemoryConnection::default();
        conn.0.lock().closed = true;
        let err = CollectorConnection::from_connection(Box::new(conn.clone()), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CaptureError::Handshake(HandshakeStatus::Dropped)));
        assert!(conn.sent().is_empty());

        // Other send failures stay transport errors
        let conn = MemoryConnection::default();
        conn.0.lock().fail_sends_after = Some(0);
        let err = CollectorConnection::from_connection(Box::new(conn), Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CaptureError::Transport(TransportError::Io(_))));
    }

    #[test]
    fn test_read_frame_and_send_query() {
        let (mut collector, conn) = welcomed(&welcome_bytes(0));
        assert!(collector.read_frame(Duration::from_millis(5)).unwrap().is_none());

        conn.push_inbound(&encode_frame(&mut Lz4Codec, b"records"));
        assert_eq!(collector.read_frame(Duration::from_millis(5)).unwrap(), Some(b"records".to_vec()));

        collector.send_query(ServerQuery::new(QueryKind::String, 0xabc, 0)).unwrap();
        let sent = conn.sent();
        assert_eq!(&sent[sent.len() - ServerQuery::SIZE..], &ServerQuery::new(QueryKind::String, 0xabc, 0).to_bytes());
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let (mut collector, conn) = welcomed(&welcome_bytes(0));
        conn.push_inbound(&u32::MAX.to_le_bytes());
        let err = collector.read_frame(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, CaptureError::Protocol(ProtocolError::FrameTooLarge(_))));
    }
}
