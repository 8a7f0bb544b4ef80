//! Session ciphers for the tunnel transport.
//!
//! This crate provides:
//! - [`SymmetricKeypair`]: the per-session ChaCha20-Poly1305 keys handed over
//!   by the handshake, with the atomic send counter used as the nonce
//! - [`ReplayWindow`]: caller-side anti-replay for authenticated counters
//!
//! The handshake itself lives elsewhere; this crate only consumes its
//! output.

#![forbid(unsafe_code)]

pub mod keypair;
pub mod replay;

pub use keypair::{
    SymmetricKeypair, REJECT_AFTER_MESSAGES, REJECT_AFTER_TIME, REKEY_AFTER_MESSAGES,
    REKEY_AFTER_TIME, TAG_SIZE,
};
pub use replay::ReplayWindow;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("keypair has been retired")]
    Retired,

    #[error("send counter exhausted, rekey required")]
    CounterExhausted,

    #[error("output buffer too small (need {requested}, have {available})")]
    BufferTooSmall { requested: usize, available: usize },

    #[error("payload of {0} bytes is too large to seal")]
    PayloadTooLarge(usize),

    #[error("replay window size must be 1-128 (got {0})")]
    InvalidWindow(u64),
}
