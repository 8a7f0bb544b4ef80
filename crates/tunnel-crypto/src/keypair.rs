//! Per-session symmetric transport keys.
//!
//! A [`SymmetricKeypair`] is what a completed handshake hands to the peer
//! session: one ChaCha20-Poly1305 key per direction and the send counter.
//!
//! The counter is the nonce. It is reserved atomically before every seal,
//! so concurrent sealers never share one, and it is carried in the clear
//! in the transport header so the receiver can open packets that arrive
//! out of order:
//!
//! ```text
//! nonce = [0, 0, 0, 0] || counter.to_le_bytes()
//! ```
//!
//! Opening takes the counter as given. Rejecting replays is up to the
//! caller (see [`ReplayWindow`](crate::ReplayWindow)).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use tunnel_common::helpers::key_fingerprint;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// Messages after which a new handshake should be started.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 60;

/// Messages after which the keypair refuses to seal (2^64 - 2^13 - 1).
pub const REJECT_AFTER_MESSAGES: u64 = u64::MAX - (1 << 13);

pub const REKEY_AFTER_TIME: Duration = Duration::from_secs(120);
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

#[derive(Zeroize, ZeroizeOnDrop)]
struct KeyMaterial {
    send: [u8; KEY_SIZE],
    receive: [u8; KEY_SIZE],
}

pub struct SymmetricKeypair {
    keys: RwLock<Option<KeyMaterial>>,
    send_counter: AtomicU64,
    created: Instant,
    fingerprint: String,
}

fn nonce_for(counter: u64) -> Nonce {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::from(nonce)
}

impl SymmetricKeypair {
    pub fn new(send_key: [u8; KEY_SIZE], receive_key: [u8; KEY_SIZE]) -> Self {
        Self::starting_at(send_key, receive_key, 0)
    }

    fn starting_at(send_key: [u8; KEY_SIZE], receive_key: [u8; KEY_SIZE], counter: u64) -> Self {
        Self {
            fingerprint: key_fingerprint(&send_key),
            keys: RwLock::new(Some(KeyMaterial {
                send: send_key,
                receive: receive_key,
            })),
            send_counter: AtomicU64::new(counter),
            created: Instant::now(),
        }
    }

    /// Two keypairs with mirrored random keys, as the two ends of a
    /// handshake would derive them.
    pub fn random_pair() -> (Self, Self) {
        let mut a = [0u8; KEY_SIZE];
        let mut b = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut a);
        OsRng.fill_bytes(&mut b);

        let pair = (Self::new(a, b), Self::new(b, a));
        a.zeroize();
        b.zeroize();
        pair
    }

    /// Non-reversible identifier of the send key, for logging.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// The counter the next seal will use.
    pub fn next_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn needs_rekey(&self) -> bool {
        self.needs_rekey_at(Instant::now())
    }

    pub fn needs_rekey_at(&self, now: Instant) -> bool {
        self.next_counter() >= REKEY_AFTER_MESSAGES
            || now.saturating_duration_since(self.created) >= REKEY_AFTER_TIME
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.is_retired()
            || self.next_counter() >= REJECT_AFTER_MESSAGES
            || now.saturating_duration_since(self.created) >= REJECT_AFTER_TIME
    }

    /// Zero the key material now. Later seal/open calls fail.
    pub fn retire(&self) {
        self.keys.write().take();
    }

    pub fn is_retired(&self) -> bool {
        self.keys.read().is_none()
    }

    fn reserve_counter(&self) -> Result<u64, CryptoError> {
        self.send_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |counter| {
                (counter < REJECT_AFTER_MESSAGES).then_some(counter + 1)
            })
            .map_err(|_| CryptoError::CounterExhausted)
    }

    /// Encrypt `plaintext` into `out`, returning the counter used.
    ///
    /// `out` must hold at least `plaintext.len() + 16` bytes; the sealed
    /// message (ciphertext then tag) occupies exactly that prefix.
    pub fn seal(&self, plaintext: &[u8], out: &mut [u8]) -> Result<u64, CryptoError> {
        let sealed_len = plaintext.len() + TAG_SIZE;
        if out.len() < sealed_len {
            return Err(CryptoError::BufferTooSmall {
                requested: sealed_len,
                available: out.len(),
            });
        }
        out[..plaintext.len()].copy_from_slice(plaintext);
        self.seal_in_place(&mut out[..sealed_len], plaintext.len())
    }

    /// Encrypt the first `plaintext_len` bytes of `buf` and write the tag
    /// right after them.
    pub fn seal_in_place(&self, buf: &mut [u8], plaintext_len: usize) -> Result<u64, CryptoError> {
        let sealed_len = plaintext_len + TAG_SIZE;
        if buf.len() < sealed_len {
            return Err(CryptoError::BufferTooSmall {
                requested: sealed_len,
                available: buf.len(),
            });
        }

        let keys = self.keys.read();
        let keys = keys.as_ref().ok_or(CryptoError::Retired)?;
        let counter = self.reserve_counter()?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.send));
        let (body, rest) = buf.split_at_mut(plaintext_len);
        let tag = cipher
            .encrypt_in_place_detached(&nonce_for(counter), b"", body)
            .map_err(|_| CryptoError::PayloadTooLarge(plaintext_len))?;
        rest[..TAG_SIZE].copy_from_slice(&tag);

        Ok(counter)
    }

    /// Decrypt `sealed` (ciphertext then tag) into `out`, returning the
    /// plaintext length. Nothing is left in `out` on failure.
    pub fn open(&self, counter: u64, sealed: &[u8], out: &mut [u8]) -> Result<usize, CryptoError> {
        if sealed.len() < TAG_SIZE {
            return Err(CryptoError::AuthenticationFailure);
        }
        let plaintext_len = sealed.len() - TAG_SIZE;
        if out.len() < sealed.len() {
            return Err(CryptoError::BufferTooSmall {
                requested: sealed.len(),
                available: out.len(),
            });
        }

        out[..sealed.len()].copy_from_slice(sealed);
        self.open_in_place(counter, &mut out[..sealed.len()])
            .inspect_err(|_| out[..plaintext_len].fill(0))
    }

    /// Decrypt `buf` (ciphertext then tag) in place. On success the first
    /// `buf.len() - 16` bytes hold the plaintext.
    pub fn open_in_place(&self, counter: u64, buf: &mut [u8]) -> Result<usize, CryptoError> {
        if buf.len() < TAG_SIZE {
            return Err(CryptoError::AuthenticationFailure);
        }
        let plaintext_len = buf.len() - TAG_SIZE;

        let keys = self.keys.read();
        let keys = keys.as_ref().ok_or(CryptoError::Retired)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&keys.receive));
        let (body, tag) = buf.split_at_mut(plaintext_len);
        let tag = Tag::from_slice(tag);
        cipher
            .decrypt_in_place_detached(&nonce_for(counter), b"", body, tag)
            .map_err(|_| CryptoError::AuthenticationFailure)?;

        Ok(plaintext_len)
    }
}

impl std::fmt::Debug for SymmetricKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKeypair")
            .field("fingerprint", &self.fingerprint)
            .field("next_counter", &self.next_counter())
            .field("retired", &self.is_retired())
            .finish()
    }
}
