//! Peer sessions on top of the session ciphers.
//!
//! This crate provides:
//! - [`OrderedPipeline`]: parallel transform with strict submission-order output
//! - [`PeerSession`]: keypair slot plus seal/open pipelines for one peer
//! - [`TransportManager`]: threads wiring a session to a TUN device and socket
//! - [`MultipleResultScope`]: fan-out of tasks, keeping the successful results

#![forbid(unsafe_code)]

pub mod error;
pub mod pipeline;
pub mod scope;
pub mod session;
pub mod transport;

pub use error::{Result, SessionError};
pub use pipeline::{OrderedPipeline, PipelineConfig, PipelineError, TryEnqueueError};
pub use scope::{CancellationToken, MultipleResultScope};
pub use session::{OpenedPacket, PeerSession, SealedMessage, SessionStats};
pub use transport::TransportManager;
