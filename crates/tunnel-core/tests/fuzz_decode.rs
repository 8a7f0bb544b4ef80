use rand::{thread_rng, Rng};
use tunnel_core::packet::destination_address;
use tunnel_core::{
    sealed_message_len, Ipv4Packet, Ipv6Packet, TransportHeader, UdpDatagram,
    MESSAGE_TRANSPORT_TYPE,
};

#[test]
fn fuzz_transport_header_never_panics() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..256);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = TransportHeader::parse(&data);
    }
}

#[test]
fn fuzz_ip_parsers_never_panic() {
    let mut rng = thread_rng();
    for _ in 0..10_000 {
        let len: usize = rng.gen_range(0..2048);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        let _ = Ipv4Packet::<UdpDatagram>::parse(&data);
        let _ = Ipv6Packet::<UdpDatagram>::parse(&data);
        let _ = UdpDatagram::parse(&data);
        let _ = destination_address(&data);
    }
}

#[test]
fn random_mutation_of_valid_header_is_handled() {
    let mut rng = thread_rng();
    let mut message = vec![0u8; sealed_message_len(32)];
    TransportHeader::new(7, 42).write_into(&mut message).unwrap();

    for _ in 0..1_000 {
        let mut mutated = message.clone();
        let flip_count = rng.gen_range(1..6);
        for _ in 0..flip_count {
            let idx = rng.gen_range(0..mutated.len());
            mutated[idx] ^= rng.gen::<u8>();
        }
        match TransportHeader::parse(&mutated) {
            Ok(_) => assert_eq!(mutated[0], MESSAGE_TRANSPORT_TYPE),
            Err(_) => assert_ne!(mutated[0], MESSAGE_TRANSPORT_TYPE),
        }
    }
}

#[test]
fn random_ipv4_packets_parse_back() {
    let mut rng = thread_rng();
    for _ in 0..200 {
        let len: usize = rng.gen_range(0..512);
        let mut payload = vec![0u8; len];
        rng.fill(&mut payload[..]);

        let packet = Ipv4Packet::new(
            rng.gen::<u32>().into(),
            rng.gen::<u32>().into(),
            UdpDatagram::new(rng.gen(), rng.gen(), payload),
        );
        let mut wire = vec![0u8; tunnel_core::L3Packet::size(&packet)];
        tunnel_core::write_packet(&packet, &mut wire).unwrap();

        assert_eq!(Ipv4Packet::parse(&wire).unwrap(), packet);
    }
}
