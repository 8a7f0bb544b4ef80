//! Runtime configuration for peer sessions.
//!
//! Defaults are tuned for a single peer on a desktop-class machine. Every
//! field can be overridden from the environment with a `TUNNEL_` prefixed
//! variable (see [`TunnelConfig::from_env`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::helpers::parse_bool;

/// Smallest usable packet buffer. A buffer holds a whole transport message
/// (16-byte header, payload, 16-byte tag), so this leaves room for at least
/// an IPv4 header behind the framing.
pub const MIN_BUFFER_SIZE: usize = 64;

/// Largest supported replay window (bitmap width).
pub const MAX_REPLAY_WINDOW: u64 = 128;

const DEFAULT_PIPELINE_CAPACITY: usize = 1024;
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_MAX_POOLED_BUFFERS: usize = 4096;
const DEFAULT_KEEPALIVE_SECS: u64 = 25;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Maximum items in flight per pipeline (enqueued but not yet dequeued).
    pub pipeline_capacity: usize,

    /// Crypto worker threads per pipeline.
    pub worker_count: usize,

    /// Size of each pooled packet buffer in bytes. Also the largest transport
    /// message sent or received, so plaintext packets are limited to
    /// `buffer_size - 32`.
    pub buffer_size: usize,

    /// Maximum idle buffers kept for reuse.
    pub max_pooled_buffers: usize,

    /// Buffers allocated up front.
    pub starting_pooled_buffers: usize,

    /// Reject inbound counters that were already accepted.
    pub replay_protection: bool,

    /// Width of the replay window (1..=128).
    pub replay_window: u64,

    /// Interval between keepalives when no other traffic is sent.
    pub keepalive_interval_secs: u64,

    /// How long I/O loops block before re-checking for shutdown.
    pub poll_interval_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            pipeline_capacity: DEFAULT_PIPELINE_CAPACITY,
            worker_count: default_worker_count(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_pooled_buffers: DEFAULT_MAX_POOLED_BUFFERS,
            starting_pooled_buffers: 0,
            replay_protection: true,
            replay_window: MAX_REPLAY_WINDOW,
            keepalive_interval_secs: DEFAULT_KEEPALIVE_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl TunnelConfig {
    /// Defaults overlaid with `TUNNEL_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("TUNNEL_PIPELINE_CAPACITY") {
            config.pipeline_capacity = parse_number("TUNNEL_PIPELINE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_WORKER_COUNT") {
            config.worker_count = parse_number("TUNNEL_WORKER_COUNT", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_BUFFER_SIZE") {
            config.buffer_size = parse_number("TUNNEL_BUFFER_SIZE", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_MAX_POOLED_BUFFERS") {
            config.max_pooled_buffers = parse_number("TUNNEL_MAX_POOLED_BUFFERS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_STARTING_POOLED_BUFFERS") {
            config.starting_pooled_buffers = parse_number("TUNNEL_STARTING_POOLED_BUFFERS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_REPLAY_PROTECTION") {
            config.replay_protection = parse_bool(&v);
        }
        if let Some(v) = lookup("TUNNEL_REPLAY_WINDOW") {
            config.replay_window = parse_number("TUNNEL_REPLAY_WINDOW", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_KEEPALIVE_SECS") {
            config.keepalive_interval_secs = parse_number("TUNNEL_KEEPALIVE_SECS", &v)?;
        }
        if let Some(v) = lookup("TUNNEL_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_number("TUNNEL_POLL_INTERVAL_MS", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the session layer relies on.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline_capacity == 0 {
            return Err(Error::config("pipeline_capacity must be non-zero"));
        }
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be non-zero"));
        }
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(Error::config(format!(
                "buffer_size must be at least {MIN_BUFFER_SIZE} bytes (got {})",
                self.buffer_size
            )));
        }
        if self.starting_pooled_buffers > self.max_pooled_buffers {
            return Err(Error::config(
                "starting_pooled_buffers cannot exceed max_pooled_buffers",
            ));
        }
        if self.replay_window == 0 || self.replay_window > MAX_REPLAY_WINDOW {
            return Err(Error::config(format!(
                "replay_window must be 1-{MAX_REPLAY_WINDOW} (got {})",
                self.replay_window
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{key}: invalid number {value:?}")))
}
