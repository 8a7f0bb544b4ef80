//! I/O threads that move packets between the TUN device, a peer session and
//! the datagram socket.
//!
//! ```text
//!  tun.read  --> submit_outbound --[seal]--> next_outbound --> socket.send_to
//!  tun.write <-- next_inbound    <--[open]-- submit_datagram <-- socket.recv_from
//! ```
//!
//! TUN reads are capped at [`PeerSession::max_packet_size`], so every sealed
//! message fits the `buffer_size` receive buffer on a peer sharing the same
//! configuration.
//!
//! The two reader threads wake at least once per poll interval to check for
//! shutdown. The two writer threads block in the session pipelines and are
//! released when the session is shut down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use tunnel_common::TunnelConfig;
use tunnel_core::io::is_timeout;
use tunnel_core::{DatagramSocket, PooledPacket, TunDevice};

use crate::error::{Result, SessionError};
use crate::session::PeerSession;

pub struct TransportManager {
    session: Arc<PeerSession>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl TransportManager {
    pub fn start(
        session: Arc<PeerSession>,
        tun: Arc<dyn TunDevice>,
        socket: Arc<dyn DatagramSocket>,
        endpoint: SocketAddr,
        config: &TunnelConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let keepalive = (config.keepalive_interval_secs > 0).then(|| config.keepalive_interval());

        let mut manager = Self {
            session: session.clone(),
            stop: stop.clone(),
            threads: Vec::with_capacity(4),
        };

        let spawned = [
            spawn("tun-reader", {
                let (session, tun, stop) = (session.clone(), tun.clone(), stop.clone());
                move || tun_reader(&session, tun.as_ref(), &stop, keepalive)
            }),
            spawn("udp-sender", {
                let (session, socket) = (session.clone(), socket.clone());
                move || udp_sender(&session, socket.as_ref(), endpoint)
            }),
            spawn("udp-receiver", {
                let (session, socket, stop) = (session.clone(), socket.clone(), stop.clone());
                move || udp_receiver(&session, socket.as_ref(), &stop)
            }),
            spawn("tun-writer", {
                let session = session.clone();
                move || tun_writer(&session, tun.as_ref())
            }),
        ];

        for handle in spawned {
            match handle {
                Ok(handle) => manager.threads.push(handle),
                Err(e) => {
                    manager.stop();
                    return Err(SessionError::Io(e));
                }
            }
        }

        info!(%endpoint, "transport started");
        Ok(manager)
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    /// Stop the I/O threads. This shuts the session down.
    pub fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.session.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("transport stopped");
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn<F>(name: &str, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}

fn tun_reader(
    session: &PeerSession,
    tun: &dyn TunDevice,
    stop: &AtomicBool,
    keepalive: Option<Duration>,
) {
    let mut last_sent = Instant::now();
    let max_packet = session.max_packet_size();

    while !stop.load(Ordering::Acquire) {
        let mut buffer = session.pool().acquire_buffer();
        let result = match tun.read(&mut buffer.as_mut_slice()[..max_packet]) {
            Ok(len) => PooledPacket::new(len, buffer)
                .map_err(SessionError::from)
                .and_then(|packet| session.submit_outbound(packet)),
            Err(e) if is_timeout(&e) => {
                if let Some(interval) = keepalive {
                    if last_sent.elapsed() >= interval && session.has_keypair() {
                        match session.send_keepalive() {
                            Ok(_) => last_sent = Instant::now(),
                            Err(SessionError::Cancelled) => break,
                            Err(e) => debug!("keepalive not sent: {}", e),
                        }
                    }
                }
                continue;
            }
            Err(e) => {
                warn!("tun read failed: {}", e);
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    break;
                }
                continue;
            }
        };

        match result {
            Ok(_) => last_sent = Instant::now(),
            Err(SessionError::Cancelled) => break,
            Err(SessionError::NoSession) => {}
            Err(e) => debug!("dropping outbound packet: {}", e),
        }
    }
    debug!("tun reader exiting");
}

fn udp_sender(session: &PeerSession, socket: &dyn DatagramSocket, endpoint: SocketAddr) {
    loop {
        match session.next_outbound() {
            Ok(message) => {
                if let Err(e) = socket.send_to(message.as_bytes(), endpoint) {
                    warn!(%endpoint, "failed to send transport message: {}", e);
                } else {
                    trace!(counter = message.counter(), len = message.len(), "sent");
                }
            }
            Err(SessionError::Cancelled) => break,
            // Already counted and logged by the session.
            Err(_) => {}
        }
    }
    debug!("udp sender exiting");
}

fn udp_receiver(session: &PeerSession, socket: &dyn DatagramSocket, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let mut buffer = session.pool().acquire_buffer();
        let (len, from) = match socket.recv_from(buffer.as_mut_slice()) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                warn!("socket receive failed: {}", e);
                continue;
            }
        };

        let packet = match PooledPacket::new(len, buffer) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(%from, "dropping datagram: {}", e);
                continue;
            }
        };

        match session.submit_datagram_packet(packet) {
            Ok(_) => {}
            Err(SessionError::Cancelled) => break,
            Err(e) => trace!(%from, "dropped datagram: {}", e),
        }
    }
    debug!("udp receiver exiting");
}

fn tun_writer(session: &PeerSession, tun: &dyn TunDevice) {
    loop {
        match session.next_inbound() {
            Ok(packet) if packet.is_keepalive() => {}
            Ok(packet) => {
                if let Err(e) = tun.write(packet.as_slice()) {
                    warn!("dropped decrypted packet on its way to the tun device: {}", e);
                }
            }
            Err(SessionError::Cancelled) => break,
            // Authentication failures and replays are counted and logged
            // by the session; the packet is simply dropped.
            Err(_) => {}
        }
    }
    debug!("tun writer exiting");
}
