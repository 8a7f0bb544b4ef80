//! Error type for the peer session layer.

use thiserror::Error;
use tunnel_core::CoreError;
use tunnel_crypto::CryptoError;

use crate::pipeline::PipelineError;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no keypair installed")]
    NoSession,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("replayed counter {0}")]
    Replay(u64),

    #[error("message for unknown receiver index {0:#010x}")]
    UnknownReceiver(u32),

    #[error("pipeline is full")]
    Full,

    #[error("session shut down")]
    Cancelled,

    #[error("crypto worker panicked")]
    WorkerPanicked,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] tunnel_common::Error),
}

impl SessionError {
    /// Failures caused by a bad or hostile datagram, which are dropped
    /// without affecting the session.
    pub fn is_packet_rejection(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::AuthenticationFailure)
                | Self::Replay(_)
                | Self::UnknownReceiver(_)
                | Self::Core(_)
        )
    }
}

impl From<PipelineError<SessionError>> for SessionError {
    fn from(err: PipelineError<SessionError>) -> Self {
        match err {
            PipelineError::Cancelled => Self::Cancelled,
            PipelineError::Transform(e) => e,
            PipelineError::Panicked => Self::WorkerPanicked,
        }
    }
}
