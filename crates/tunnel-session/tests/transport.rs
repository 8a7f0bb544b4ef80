//! Two peers exchanging packets through memory TUN devices and loopback UDP.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tunnel_common::TunnelConfig;
use tunnel_core::{
    write_packet, Ipv4Packet, L3Packet, MemoryTun, MemoryTunHandle, UdpDatagram,
    UdpDatagramSocket,
};
use tunnel_crypto::SymmetricKeypair;
use tunnel_session::{PeerSession, SessionError, TransportManager};

struct Peer {
    handle: MemoryTunHandle,
    manager: TransportManager,
}

fn config() -> TunnelConfig {
    TunnelConfig {
        pipeline_capacity: 32,
        worker_count: 2,
        buffer_size: 2048,
        keepalive_interval_secs: 0,
        poll_interval_ms: 10,
        ..TunnelConfig::default()
    }
}

fn connected_peers(config: &TunnelConfig) -> Result<(Peer, Peer)> {
    tunnel_common::init_tracing_with_default("warn");

    let poll = config.poll_interval();
    let socket_a = UdpDatagramSocket::bind("127.0.0.1:0".parse()?, poll)?;
    let socket_b = UdpDatagramSocket::bind("127.0.0.1:0".parse()?, poll)?;
    let addr_a = socket_a.local_addr()?;
    let addr_b = socket_b.local_addr()?;

    let session_a = Arc::new(PeerSession::with_local_index(config, 0xa)?);
    let session_b = Arc::new(PeerSession::with_local_index(config, 0xb)?);
    let (key_a, key_b) = SymmetricKeypair::random_pair();
    session_a.install_keypair(key_a, session_b.local_index())?;
    session_b.install_keypair(key_b, session_a.local_index())?;

    let (tun_a, handle_a) = MemoryTun::pair(poll);
    let (tun_b, handle_b) = MemoryTun::pair(poll);

    let manager_a = TransportManager::start(
        session_a,
        Arc::new(tun_a),
        Arc::new(socket_a),
        addr_b,
        config,
    )?;
    let manager_b = TransportManager::start(
        session_b,
        Arc::new(tun_b),
        Arc::new(socket_b),
        addr_a,
        config,
    )?;

    Ok((
        Peer {
            handle: handle_a,
            manager: manager_a,
        },
        Peer {
            handle: handle_b,
            manager: manager_b,
        },
    ))
}

fn udp_packet(n: u32) -> Vec<u8> {
    let packet = Ipv4Packet::new(
        Ipv4Addr::new(10, 0, 0, 1),
        Ipv4Addr::new(10, 0, 0, 2),
        UdpDatagram::new(4000, 5000, n.to_be_bytes().to_vec()),
    );
    let mut wire = vec![0u8; packet.size()];
    write_packet(&packet, &mut wire).unwrap();
    wire
}

#[test]
fn test_packets_cross_the_tunnel_in_order() -> Result<()> {
    let (a, b) = connected_peers(&config())?;

    for n in 0..200 {
        a.handle.inject(udp_packet(n))?;
    }
    for n in 0..200 {
        let received = b
            .handle
            .recv_timeout(Duration::from_secs(5))
            .ok_or_else(|| anyhow!("packet {} never arrived", n))?;
        assert_eq!(received, udp_packet(n));
    }

    let stats_a = a.manager.session().stats();
    let stats_b = b.manager.session().stats();
    assert_eq!(stats_a.packets_sealed, 200);
    assert_eq!(stats_b.packets_opened, 200);
    assert_eq!(stats_b.auth_failures, 0);
    Ok(())
}

#[test]
fn test_full_size_packets_cross_the_tunnel() -> Result<()> {
    let config = config();
    let (a, b) = connected_peers(&config)?;
    let max = a.manager.session().max_packet_size();
    assert_eq!(max, config.buffer_size - 32);

    // A full buffer of plaintext leaves no room for header and tag, so the
    // reader refuses it rather than sending a message the peer would truncate.
    a.handle.inject(vec![0x45; config.buffer_size])?;
    a.handle.inject(vec![0x45; max])?;
    a.handle.inject(udp_packet(7))?;

    assert_eq!(
        b.handle.recv_timeout(Duration::from_secs(5)),
        Some(vec![0x45; max])
    );
    assert_eq!(
        b.handle.recv_timeout(Duration::from_secs(5)),
        Some(udp_packet(7))
    );

    let stats_a = a.manager.session().stats();
    let stats_b = b.manager.session().stats();
    assert_eq!(stats_a.packets_sealed, 2);
    assert_eq!(stats_b.packets_opened, 2);
    assert_eq!(stats_b.auth_failures, 0);
    Ok(())
}

#[test]
fn test_both_directions() -> Result<()> {
    let (a, b) = connected_peers(&config())?;

    a.handle.inject(udp_packet(1))?;
    b.handle.inject(udp_packet(2))?;

    assert_eq!(
        b.handle.recv_timeout(Duration::from_secs(5)),
        Some(udp_packet(1))
    );
    assert_eq!(
        a.handle.recv_timeout(Duration::from_secs(5)),
        Some(udp_packet(2))
    );
    Ok(())
}

#[test]
fn test_keepalives_are_not_written_to_tun() -> Result<()> {
    let config = TunnelConfig {
        keepalive_interval_secs: 1,
        ..config()
    };
    let (a, b) = connected_peers(&config)?;

    thread::sleep(Duration::from_millis(1_500));
    assert!(b.handle.recv_timeout(Duration::from_millis(100)).is_none());
    assert!(a.manager.session().stats().keepalives_sent >= 1);
    assert!(b.manager.session().stats().keepalives_received >= 1);
    Ok(())
}

#[test]
fn test_stop_shuts_session_down() -> Result<()> {
    let (mut a, _b) = connected_peers(&config())?;
    a.manager.stop();

    let session = a.manager.session();
    assert!(!session.has_keypair());
    assert!(matches!(session.next_outbound(), Err(SessionError::Cancelled)));
    Ok(())
}
