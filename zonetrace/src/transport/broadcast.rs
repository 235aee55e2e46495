//! UDP discovery announcements
//!
//! While waiting for a collector the worker periodically announces itself to
//! the local network so collectors can list running clients.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use zonetrace_common::{BroadcastMessage, BROADCAST_VERSION, PROGRAM_NAME_SIZE, PROTOCOL_VERSION};

use crate::domain::{Pid, TransportError};
use crate::handshake::fixed_field;

/// `active_time` value announcing that a collector is attached
pub const ACTIVE_TIME_CONNECTED: i32 = -1;

#[derive(Debug)]
pub struct Broadcaster {
    socket: UdpSocket,
    target: SocketAddr,
    message: BroadcastMessage,
}

impl Broadcaster {
    /// Announce to `255.255.255.255:broadcast_port`
    ///
    /// # Errors
    /// When the socket cannot be bound or switched to broadcast.
    pub fn new(broadcast_port: u16, listen_port: u16, program_name: &str) -> std::io::Result<Self> {
        let target = SocketAddr::from((Ipv4Addr::BROADCAST, broadcast_port));
        let broadcaster = Self::with_target(target, listen_port, program_name)?;
        broadcaster.socket.set_broadcast(true)?;
        Ok(broadcaster)
    }

    /// Announce to a fixed address instead of the broadcast address
    ///
    /// # Errors
    /// When the socket cannot be bound.
    pub fn with_target(target: SocketAddr, listen_port: u16, program_name: &str) -> std::io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let message = BroadcastMessage {
            broadcast_version: BROADCAST_VERSION,
            listen_port,
            protocol_version: PROTOCOL_VERSION,
            pid: u64::from(Pid::current().0),
            active_time: 0,
            program_name: fixed_field::<PROGRAM_NAME_SIZE>(program_name),
        };
        Ok(Self { socket, target, message })
    }

    /// Send one datagram; `active_time` is seconds since start
    ///
    /// # Errors
    /// Socket errors from `send_to`.
    pub fn send(&mut self, active_time: i32) -> Result<(), TransportError> {
        self.message.active_time = active_time;
        self.socket.send_to(&self.message.to_bytes(), self.target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use zonetrace_common::trim_padded;

    #[test]
    fn test_datagram_layout() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let target = receiver.local_addr().unwrap();

        let mut broadcaster = Broadcaster::with_target(target, 9001, "render-server").unwrap();
        broadcaster.send(42).unwrap();

        let mut buf = [0u8; BroadcastMessage::SIZE];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(n, BroadcastMessage::SIZE);

        let message = BroadcastMessage::from_bytes(&buf);
        assert_eq!(message.listen_port, 9001);
        assert_eq!(message.protocol_version, PROTOCOL_VERSION);
        assert_eq!(message.active_time, 42);
        assert_eq!(message.pid, u64::from(std::process::id()));
        assert_eq!(trim_padded(&message.program_name), b"render-server");
        assert!(format!("{broadcaster:?}").contains("listen_port: 9001"));
    }
}
