//! Common error types for the tunnel core.

use thiserror::Error;

/// Result type alias using the shared error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading or checking [`TunnelConfig`](crate::TunnelConfig).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
