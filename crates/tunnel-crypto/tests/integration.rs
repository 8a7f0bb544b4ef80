//! Integration tests for session keypairs under concurrent use.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use rand::{thread_rng, Rng};
use tunnel_crypto::{CryptoError, ReplayWindow, SymmetricKeypair, TAG_SIZE};

#[test]
fn test_concurrent_seal_counters_unique_and_contiguous() {
    let (alice, _bob) = SymmetricKeypair::random_pair();
    let alice = Arc::new(alice);
    let threads = 8;
    let per_thread = 2_000;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let alice = alice.clone();
            thread::spawn(move || {
                let mut out = [0u8; 64];
                (0..per_thread)
                    .map(|_| alice.seal(b"payload", &mut out).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut counters = HashSet::new();
    for handle in handles {
        for counter in handle.join().unwrap() {
            assert!(counters.insert(counter), "counter {} reused", counter);
        }
    }

    let total = (threads * per_thread) as u64;
    assert_eq!(counters.len() as u64, total);
    assert!((0..total).all(|c| counters.contains(&c)));
    assert_eq!(alice.next_counter(), total);
}

#[test]
fn test_concurrent_roundtrip() {
    let (alice, bob) = SymmetricKeypair::random_pair();
    let alice = Arc::new(alice);
    let bob = Arc::new(bob);

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let alice = alice.clone();
            let bob = bob.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    let plaintext = format!("thread {t} packet {i}").into_bytes();
                    let mut sealed = vec![0u8; plaintext.len() + TAG_SIZE];
                    let counter = alice.seal(&plaintext, &mut sealed).unwrap();

                    let mut opened = vec![0u8; sealed.len()];
                    let len = bob.open(counter, &sealed, &mut opened).unwrap();
                    assert_eq!(&opened[..len], &plaintext[..]);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_every_flipped_bit_is_rejected() {
    let (alice, bob) = SymmetricKeypair::random_pair();
    let plaintext = b"tamper evident";
    let mut sealed = vec![0u8; plaintext.len() + TAG_SIZE];
    let counter = alice.seal(plaintext, &mut sealed).unwrap();

    let mut out = vec![0u8; sealed.len()];
    for byte in 0..sealed.len() {
        for bit in 0..8 {
            let mut tampered = sealed.clone();
            tampered[byte] ^= 1 << bit;
            assert_eq!(
                bob.open(counter, &tampered, &mut out),
                Err(CryptoError::AuthenticationFailure),
                "flip at byte {} bit {} accepted",
                byte,
                bit
            );
        }
    }

    assert_eq!(bob.open(counter, &sealed, &mut out).unwrap(), plaintext.len());
}

#[test]
fn test_wrong_counter_is_rejected() {
    let (alice, bob) = SymmetricKeypair::random_pair();
    let mut rng = thread_rng();
    let mut sealed = [0u8; 32 + TAG_SIZE];
    let mut payload = [0u8; 32];
    rng.fill(&mut payload[..]);

    let counter = alice.seal(&payload, &mut sealed).unwrap();
    let mut out = [0u8; 32 + TAG_SIZE];
    for wrong in [counter + 1, counter + 1_000, u64::MAX] {
        assert_eq!(
            bob.open(wrong, &sealed, &mut out),
            Err(CryptoError::AuthenticationFailure)
        );
    }
}

#[test]
fn test_out_of_order_open_with_replay_window() {
    let (alice, bob) = SymmetricKeypair::random_pair();
    let mut sealed: Vec<(u64, Vec<u8>)> = (0..64u8)
        .map(|i| {
            let mut buf = vec![0u8; 1 + TAG_SIZE];
            let counter = alice.seal(&[i], &mut buf).unwrap();
            (counter, buf)
        })
        .collect();
    sealed.reverse();

    let mut window = ReplayWindow::default();
    let mut out = [0u8; 1 + TAG_SIZE];
    for (counter, message) in &sealed {
        bob.open(*counter, message, &mut out).unwrap();
        assert_eq!(out[0] as u64, *counter);
        assert!(window.check_and_update(*counter));
    }

    // Every counter is now a replay.
    for (counter, message) in &sealed {
        bob.open(*counter, message, &mut out).unwrap();
        assert!(!window.check_and_update(*counter));
    }
}
