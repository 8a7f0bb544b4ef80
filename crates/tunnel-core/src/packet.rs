//! Network-layer packet abstraction.
//!
//! The session layer never looks inside a payload. Anything it seals only
//! has to report its serialized size and write exactly that many bytes, so
//! raw datagrams read from a TUN device, constructed IPv4/IPv6 packets and
//! zero-length keepalives all travel through the same path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes};

use crate::CoreError;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV6_HEADER_SIZE: usize = 40;
pub const UDP_HEADER_SIZE: usize = 8;
pub const PROTOCOL_UDP: u8 = 17;

/// A payload that can be serialized into a transport message.
///
/// `size` must be stable between calls, and `write` must put exactly `size`
/// bytes at the buffer's current position. Sizing the buffer is the caller's
/// job; [`write_packet`] does the check for slice-backed buffers.
pub trait L3Packet: Send + Sync {
    fn size(&self) -> usize;
    fn write(&self, buf: &mut dyn BufMut);
}

/// A transport-layer payload carried inside an IPv4/IPv6 packet.
pub trait L4Packet: Send + Sync {
    fn protocol(&self) -> u8;
    fn size(&self) -> usize;
    fn write(&self, pseudo: &PseudoHeader, buf: &mut dyn BufMut);
}

/// Serialize `packet` at the start of `buf`, returning the bytes written.
pub fn write_packet(packet: &dyn L3Packet, buf: &mut [u8]) -> Result<usize, CoreError> {
    let size = packet.size();
    if buf.len() < size {
        return Err(CoreError::Capacity {
            requested: size,
            available: buf.len(),
        });
    }

    let mut cursor = &mut buf[..size];
    packet.write(&mut cursor);
    debug_assert!(cursor.is_empty(), "L3Packet wrote fewer bytes than its size");
    Ok(size)
}

/// IP version nibble of a raw packet.
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// Destination address of a raw IPv4/IPv6 packet.
pub fn destination_address(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        4 if packet.len() >= IPV4_HEADER_SIZE => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= IPV6_HEADER_SIZE => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Add `data` to a running RFC 1071 ones' complement sum.
pub fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([pair[0], pair[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }
    sum
}

/// Fold a running sum into the final 16-bit checksum.
pub fn fold_checksum(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Addresses covered by the transport-layer checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoHeader {
    V4 { source: Ipv4Addr, destination: Ipv4Addr },
    V6 { source: Ipv6Addr, destination: Ipv6Addr },
}

impl PseudoHeader {
    /// Partial checksum over the pseudo header for an L4 segment.
    pub fn sum(&self, protocol: u8, length: usize) -> u32 {
        match self {
            Self::V4 {
                source,
                destination,
            } => {
                let mut sum = ones_complement_sum(0, &source.octets());
                sum = ones_complement_sum(sum, &destination.octets());
                sum = sum.wrapping_add(u32::from(protocol));
                sum.wrapping_add(length as u32 & 0xffff)
            }
            Self::V6 {
                source,
                destination,
            } => {
                let mut sum = ones_complement_sum(0, &source.octets());
                sum = ones_complement_sum(sum, &destination.octets());
                sum = ones_complement_sum(sum, &(length as u32).to_be_bytes());
                sum.wrapping_add(u32::from(protocol))
            }
        }
    }
}

/// Zero-length payload. Sealing it produces a keepalive message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Keepalive;

impl L3Packet for Keepalive {
    fn size(&self) -> usize {
        0
    }

    fn write(&self, _buf: &mut dyn BufMut) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source_port: u16,
    pub destination_port: u16,
    pub data: Bytes,
}

impl UdpDatagram {
    pub fn new(source_port: u16, destination_port: u16, data: impl Into<Bytes>) -> Self {
        Self {
            source_port,
            destination_port,
            data: data.into(),
        }
    }

    pub fn checksum(&self, pseudo: &PseudoHeader) -> u16 {
        let length = self.size();
        let mut sum = pseudo.sum(PROTOCOL_UDP, length);
        sum = ones_complement_sum(sum, &self.source_port.to_be_bytes());
        sum = ones_complement_sum(sum, &self.destination_port.to_be_bytes());
        sum = ones_complement_sum(sum, &(length as u16).to_be_bytes());
        sum = ones_complement_sum(sum, &self.data);

        // Zero means "no checksum" on the wire.
        match fold_checksum(sum) {
            0 => 0xffff,
            csum => csum,
        }
    }

    pub fn parse(segment: &[u8]) -> Result<Self, CoreError> {
        if segment.len() < UDP_HEADER_SIZE {
            return Err(CoreError::TooShort(segment.len()));
        }

        let mut cursor = segment;
        let source_port = cursor.get_u16();
        let destination_port = cursor.get_u16();
        let length = cursor.get_u16() as usize;
        let _checksum = cursor.get_u16();

        if length < UDP_HEADER_SIZE || length > segment.len() {
            return Err(CoreError::Malformed("udp length field"));
        }

        Ok(Self {
            source_port,
            destination_port,
            data: Bytes::copy_from_slice(&segment[UDP_HEADER_SIZE..length]),
        })
    }
}

impl L4Packet for UdpDatagram {
    fn protocol(&self) -> u8 {
        PROTOCOL_UDP
    }

    fn size(&self) -> usize {
        UDP_HEADER_SIZE + self.data.len()
    }

    fn write(&self, pseudo: &PseudoHeader, buf: &mut dyn BufMut) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u16(self.size() as u16);
        buf.put_u16(self.checksum(pseudo));
        buf.put_slice(&self.data);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet<P> {
    pub dscp: u8,
    pub ecn: u8,
    pub identification: u16,
    pub flags: u8,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub payload: P,
}

impl<P: L4Packet> Ipv4Packet<P> {
    /// Unfragmented packet with a random identification and TTL 64.
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, payload: P) -> Self {
        Self {
            dscp: 0,
            ecn: 0,
            identification: rand::random(),
            flags: 0,
            fragment_offset: 0,
            ttl: 64,
            source,
            destination,
            payload,
        }
    }

    fn put_header(&self, buf: &mut dyn BufMut, checksum: u16) {
        buf.put_u8((4 << 4) | 5);
        buf.put_u8((self.dscp << 2) | (self.ecn & 0x3));
        buf.put_u16(self.size() as u16);
        buf.put_u16(self.identification);
        buf.put_u16((u16::from(self.flags & 0x7) << 13) | (self.fragment_offset & 0x1fff));
        buf.put_u8(self.ttl);
        buf.put_u8(self.payload.protocol());
        buf.put_u16(checksum);
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());
    }

    pub fn header_checksum(&self) -> u16 {
        let mut header = [0u8; IPV4_HEADER_SIZE];
        let mut cursor = &mut header[..];
        self.put_header(&mut cursor, 0);
        fold_checksum(ones_complement_sum(0, &header))
    }

    pub fn pseudo_header(&self) -> PseudoHeader {
        PseudoHeader::V4 {
            source: self.source,
            destination: self.destination,
        }
    }
}

impl<P: L4Packet> L3Packet for Ipv4Packet<P> {
    fn size(&self) -> usize {
        IPV4_HEADER_SIZE + self.payload.size()
    }

    fn write(&self, buf: &mut dyn BufMut) {
        self.put_header(buf, self.header_checksum());
        self.payload.write(&self.pseudo_header(), buf);
    }
}

impl Ipv4Packet<UdpDatagram> {
    pub fn parse(packet: &[u8]) -> Result<Self, CoreError> {
        if packet.len() < IPV4_HEADER_SIZE {
            return Err(CoreError::TooShort(packet.len()));
        }

        let mut cursor = packet;
        let version_ihl = cursor.get_u8();
        if version_ihl >> 4 != 4 {
            return Err(CoreError::Malformed("not an ipv4 packet"));
        }
        let header_len = usize::from(version_ihl & 0xf) * 4;
        if header_len < IPV4_HEADER_SIZE {
            return Err(CoreError::Malformed("ipv4 header length"));
        }

        let dscp_ecn = cursor.get_u8();
        let total_len = cursor.get_u16() as usize;
        let identification = cursor.get_u16();
        let flags_fragment = cursor.get_u16();
        let ttl = cursor.get_u8();
        let protocol = cursor.get_u8();
        let _checksum = cursor.get_u16();
        let source = Ipv4Addr::from(cursor.get_u32());
        let destination = Ipv4Addr::from(cursor.get_u32());

        if total_len < header_len || total_len > packet.len() {
            return Err(CoreError::Malformed("ipv4 total length"));
        }
        if protocol != PROTOCOL_UDP {
            return Err(CoreError::Malformed("ipv4 payload is not udp"));
        }

        Ok(Self {
            dscp: dscp_ecn >> 2,
            ecn: dscp_ecn & 0x3,
            identification,
            flags: (flags_fragment >> 13) as u8,
            fragment_offset: flags_fragment & 0x1fff,
            ttl,
            source,
            destination,
            payload: UdpDatagram::parse(&packet[header_len..total_len])?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Packet<P> {
    pub traffic_class: u8,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: P,
}

impl<P: L4Packet> Ipv6Packet<P> {
    pub fn new(source: Ipv6Addr, destination: Ipv6Addr, payload: P) -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            hop_limit: 64,
            source,
            destination,
            payload,
        }
    }

    pub fn pseudo_header(&self) -> PseudoHeader {
        PseudoHeader::V6 {
            source: self.source,
            destination: self.destination,
        }
    }
}

impl<P: L4Packet> L3Packet for Ipv6Packet<P> {
    fn size(&self) -> usize {
        IPV6_HEADER_SIZE + self.payload.size()
    }

    fn write(&self, buf: &mut dyn BufMut) {
        buf.put_u32((6 << 28) | (u32::from(self.traffic_class) << 20) | (self.flow_label & 0xf_ffff));
        buf.put_u16(self.payload.size() as u16);
        buf.put_u8(self.payload.protocol());
        buf.put_u8(self.hop_limit);
        buf.put_slice(&self.source.octets());
        buf.put_slice(&self.destination.octets());
        self.payload.write(&self.pseudo_header(), buf);
    }
}

impl Ipv6Packet<UdpDatagram> {
    pub fn parse(packet: &[u8]) -> Result<Self, CoreError> {
        if packet.len() < IPV6_HEADER_SIZE {
            return Err(CoreError::TooShort(packet.len()));
        }

        let mut cursor = packet;
        let first = cursor.get_u32();
        if first >> 28 != 6 {
            return Err(CoreError::Malformed("not an ipv6 packet"));
        }
        let payload_len = cursor.get_u16() as usize;
        let next_header = cursor.get_u8();
        let hop_limit = cursor.get_u8();
        let source = Ipv6Addr::from(cursor.get_u128());
        let destination = Ipv6Addr::from(cursor.get_u128());

        if IPV6_HEADER_SIZE + payload_len > packet.len() {
            return Err(CoreError::Malformed("ipv6 payload length"));
        }
        if next_header != PROTOCOL_UDP {
            return Err(CoreError::Malformed("ipv6 payload is not udp"));
        }

        Ok(Self {
            traffic_class: ((first >> 20) & 0xff) as u8,
            flow_label: first & 0xf_ffff,
            hop_limit,
            source,
            destination,
            payload: UdpDatagram::parse(&packet[IPV6_HEADER_SIZE..IPV6_HEADER_SIZE + payload_len])?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn sample_v4() -> Ipv4Packet<UdpDatagram> {
        Ipv4Packet::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            UdpDatagram::new(5000, 53, &b"hello"[..]),
        )
    }

    #[test]
    fn test_write_consumes_exactly_size() {
        let packet = sample_v4();
        let mut storage = vec![0u8; 128];
        let mut cursor = &mut storage[..];
        packet.write(&mut cursor);

        assert_eq!(cursor.len(), 128 - packet.size());
        assert_eq!(packet.size(), IPV4_HEADER_SIZE + UDP_HEADER_SIZE + 5);
    }

    #[test]
    fn test_write_into_growable_buffer() {
        let packet = Ipv6Packet::new(
            Ipv6Addr::LOCALHOST,
            Ipv6Addr::LOCALHOST,
            UdpDatagram::new(1, 2, vec![0u8; 33]),
        );
        let mut buf = BytesMut::new();
        buf.put_u8(0xaa);
        packet.write(&mut buf);

        assert_eq!(buf.len(), 1 + packet.size());
        assert_eq!(buf[1] >> 4, 6);
    }

    #[test]
    fn test_size_is_stable() {
        let packet = sample_v4();
        assert_eq!(packet.size(), packet.size());
    }

    #[test]
    fn test_write_packet_checks_capacity() {
        let packet = sample_v4();
        let mut small = vec![0u8; packet.size() - 1];
        assert_eq!(
            write_packet(&packet, &mut small),
            Err(CoreError::Capacity {
                requested: packet.size(),
                available: packet.size() - 1,
            })
        );

        let mut exact = vec![0u8; packet.size()];
        assert_eq!(write_packet(&packet, &mut exact), Ok(packet.size()));
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let packet = sample_v4();
        let mut wire = vec![0u8; packet.size()];
        write_packet(&packet, &mut wire).unwrap();

        // A correct header sums to zero.
        assert_eq!(fold_checksum(ones_complement_sum(0, &wire[..IPV4_HEADER_SIZE])), 0);
    }

    #[test]
    fn test_udp_checksum_verifies() {
        let packet = sample_v4();
        let mut wire = vec![0u8; packet.size()];
        write_packet(&packet, &mut wire).unwrap();

        let segment = &wire[IPV4_HEADER_SIZE..];
        let sum = packet.pseudo_header().sum(PROTOCOL_UDP, segment.len());
        assert_eq!(fold_checksum(ones_complement_sum(sum, segment)), 0);
    }

    #[test]
    fn test_ipv4_parse_roundtrip() {
        let packet = sample_v4();
        let mut wire = vec![0u8; packet.size()];
        write_packet(&packet, &mut wire).unwrap();

        assert_eq!(Ipv4Packet::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn test_ipv6_parse_roundtrip() {
        let packet = Ipv6Packet::new(
            "fd00::1".parse().unwrap(),
            "fd00::2".parse().unwrap(),
            UdpDatagram::new(4000, 4001, &b"payload"[..]),
        );
        let mut wire = vec![0u8; packet.size()];
        write_packet(&packet, &mut wire).unwrap();

        assert_eq!(Ipv6Packet::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn test_destination_address() {
        let packet = sample_v4();
        let mut wire = vec![0u8; packet.size()];
        write_packet(&packet, &mut wire).unwrap();

        assert_eq!(
            destination_address(&wire),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))
        );
        assert_eq!(destination_address(&[0x45, 0, 0]), None);
        assert_eq!(destination_address(&[]), None);
    }

    #[test]
    fn test_keepalive_is_empty() {
        let mut buf = BytesMut::new();
        Keepalive.write(&mut buf);
        assert_eq!(Keepalive.size(), 0);
        assert!(buf.is_empty());
    }
}
