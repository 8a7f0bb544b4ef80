//! Raw I/O seams: the TUN device and the datagram socket.
//!
//! Both are plain byte sources and sinks. Reads block for at most a poll
//! interval and report a timeout as `WouldBlock`/`TimedOut`, which lets the
//! I/O threads notice shutdown without a dedicated wakeup mechanism.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use socket2::SockRef;
use tracing::debug;

/// DSCP Expedited Forwarding, shifted into the TOS byte.
const DSCP_EF: u32 = 0xb8;

const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one complete packet.
    fn write(&self, packet: &[u8]) -> io::Result<usize>;
}

pub trait DatagramSocket: Send + Sync {
    fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

/// Whether an I/O error only means "nothing arrived within the poll interval".
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Channel-backed TUN device.
///
/// The paired [`MemoryTunHandle`] plays the role of the kernel: it injects
/// packets for the tunnel to read and collects the packets the tunnel
/// writes.
pub struct MemoryTun {
    inbound: Receiver<Vec<u8>>,
    outbound: Sender<Vec<u8>>,
    poll_interval: Duration,
}

pub struct MemoryTunHandle {
    inbound: Sender<Vec<u8>>,
    outbound: Receiver<Vec<u8>>,
}

impl MemoryTun {
    pub fn pair(poll_interval: Duration) -> (Self, MemoryTunHandle) {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
        (
            Self {
                inbound: inbound_rx,
                outbound: outbound_tx,
                poll_interval,
            },
            MemoryTunHandle {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

impl TunDevice for MemoryTun {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inbound.recv_timeout(self.poll_interval) {
            Ok(packet) => {
                if packet.len() > buf.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("packet of {} bytes exceeds buffer of {}", packet.len(), buf.len()),
                    ));
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(packet.len())
            }
            Err(RecvTimeoutError::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            Err(RecvTimeoutError::Disconnected) => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        self.outbound
            .send(packet.to_vec())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(packet.len())
    }
}

impl MemoryTunHandle {
    /// Queue a packet for the tunnel to read.
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> io::Result<()> {
        self.inbound
            .send(packet.into())
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    /// Next packet the tunnel wrote, if one arrives within `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.outbound.recv_timeout(timeout).ok()
    }
}

/// UDP socket tuned for tunnel traffic.
pub struct UdpDatagramSocket {
    socket: UdpSocket,
}

impl UdpDatagramSocket {
    pub fn bind(addr: SocketAddr, poll_interval: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(poll_interval))?;

        let sock = SockRef::from(&socket);
        if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set receive buffer size: {}", e);
        }
        if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            debug!("failed to set send buffer size: {}", e);
        }
        if addr.is_ipv4() {
            if let Err(e) = sock.set_tos_v4(DSCP_EF) {
                debug!("failed to set DSCP/TOS: {}", e);
            }
        }

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl DatagramSocket for UdpDatagramSocket {
    fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(datagram, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_tun_roundtrip() {
        let (tun, handle) = MemoryTun::pair(Duration::from_millis(10));

        handle.inject(vec![1, 2, 3]).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(tun.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);

        tun.write(&[9, 9]).unwrap();
        assert_eq!(
            handle.recv_timeout(Duration::from_secs(1)),
            Some(vec![9, 9])
        );
    }

    #[test]
    fn test_memory_tun_read_times_out() {
        let (tun, _handle) = MemoryTun::pair(Duration::from_millis(5));
        let mut buf = [0u8; 16];
        let err = tun.read(&mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_memory_tun_rejects_oversize() {
        let (tun, handle) = MemoryTun::pair(Duration::from_millis(10));
        handle.inject(vec![0u8; 32]).unwrap();

        let mut buf = [0u8; 16];
        let err = tun.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_udp_loopback() {
        let timeout = Duration::from_millis(500);
        let a = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap(), timeout).unwrap();
        let b = UdpDatagramSocket::bind("127.0.0.1:0".parse().unwrap(), timeout).unwrap();

        a.send_to(b"ping", b.local_addr().unwrap()).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
