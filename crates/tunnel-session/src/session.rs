//! Per-peer session: keypair slot, buffer pool and the two crypto pipelines.
//!
//! Outbound packets go through the seal pipeline and come out as complete
//! transport messages (header, ciphertext, tag) ready for the socket.
//! Inbound transport messages go through the open pipeline and come out as
//! plaintext for the TUN device. Both preserve submission order.
//!
//! Every queued item carries the keypair that was active when it was
//! submitted. Installing a new keypair retires the old one immediately, so
//! items still queued under it fail with [`CryptoError::Retired`] instead of
//! being sealed with stale keys.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use tunnel_common::TunnelConfig;
use tunnel_core::{
    sealed_message_len, write_packet, Keepalive, L3Packet, PacketBufferPool,
    CoreError, PacketBufferPoolConfig, PooledPacket, TransportHeader, MIN_TRANSPORT_MESSAGE_SIZE,
    TRANSPORT_HEADER_SIZE,
};
use tunnel_crypto::{CryptoError, ReplayWindow, SymmetricKeypair};

use crate::error::{Result, SessionError};
use crate::pipeline::{OrderedPipeline, PipelineConfig, PipelineError, TryEnqueueError};

#[derive(Clone)]
struct ActiveKeypair {
    keypair: Arc<SymmetricKeypair>,
    remote_index: u32,
    replay: Option<Arc<Mutex<ReplayWindow>>>,
}

struct OutboundJob {
    packet: Box<dyn L3Packet>,
    active: ActiveKeypair,
}

struct InboundJob {
    counter: u64,
    message: PooledPacket,
    /// Start of ciphertext within `message`.
    offset: usize,
    active: ActiveKeypair,
}

/// A sealed transport message ready to be sent.
#[derive(Debug)]
pub struct SealedMessage {
    counter: u64,
    receiver_index: u32,
    message: PooledPacket,
}

impl SealedMessage {
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn receiver_index(&self) -> u32 {
        self.receiver_index
    }

    /// The complete wire message.
    pub fn as_bytes(&self) -> &[u8] {
        self.message.as_slice()
    }

    pub fn len(&self) -> usize {
        self.message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    pub fn into_packet(self) -> PooledPacket {
        self.message
    }
}

/// Plaintext recovered from an inbound transport message.
#[derive(Debug)]
pub struct OpenedPacket {
    counter: u64,
    packet: PooledPacket,
}

impl OpenedPacket {
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn as_slice(&self) -> &[u8] {
        self.packet.as_slice()
    }

    /// Zero-length plaintext carries no packet.
    pub fn is_keepalive(&self) -> bool {
        self.packet.is_empty()
    }

    pub fn into_packet(self) -> PooledPacket {
        self.packet
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub packets_sealed: u64,
    pub bytes_sealed: u64,
    pub packets_opened: u64,
    pub bytes_opened: u64,
    pub keepalives_sent: u64,
    pub keepalives_received: u64,
    pub auth_failures: u64,
    pub replays_rejected: u64,
    pub invalid_messages: u64,
    pub seal_failures: u64,
    pub dropped_no_session: u64,
    pub dropped_full: u64,
    pub dropped_oversize: u64,
}

#[derive(Default)]
struct SessionCounters {
    packets_sealed: AtomicU64,
    bytes_sealed: AtomicU64,
    packets_opened: AtomicU64,
    bytes_opened: AtomicU64,
    keepalives_sent: AtomicU64,
    keepalives_received: AtomicU64,
    auth_failures: AtomicU64,
    replays_rejected: AtomicU64,
    invalid_messages: AtomicU64,
    seal_failures: AtomicU64,
    dropped_no_session: AtomicU64,
    dropped_full: AtomicU64,
    dropped_oversize: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl SessionCounters {
    fn snapshot(&self) -> SessionStats {
        SessionStats {
            packets_sealed: self.packets_sealed.load(Ordering::Relaxed),
            bytes_sealed: self.bytes_sealed.load(Ordering::Relaxed),
            packets_opened: self.packets_opened.load(Ordering::Relaxed),
            bytes_opened: self.bytes_opened.load(Ordering::Relaxed),
            keepalives_sent: self.keepalives_sent.load(Ordering::Relaxed),
            keepalives_received: self.keepalives_received.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            replays_rejected: self.replays_rejected.load(Ordering::Relaxed),
            invalid_messages: self.invalid_messages.load(Ordering::Relaxed),
            seal_failures: self.seal_failures.load(Ordering::Relaxed),
            dropped_no_session: self.dropped_no_session.load(Ordering::Relaxed),
            dropped_full: self.dropped_full.load(Ordering::Relaxed),
            dropped_oversize: self.dropped_oversize.load(Ordering::Relaxed),
        }
    }
}

pub struct PeerSession {
    local_index: u32,
    replay_protection: bool,
    replay_window: u64,
    pool: PacketBufferPool,
    active: RwLock<Option<ActiveKeypair>>,
    counters: Arc<SessionCounters>,
    outbound: OrderedPipeline<OutboundJob, SealedMessage, SessionError>,
    inbound: OrderedPipeline<InboundJob, OpenedPacket, SessionError>,
}

impl PeerSession {
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        Self::with_local_index(config, rand::random())
    }

    /// Session whose transport messages are addressed to `local_index`.
    pub fn with_local_index(config: &TunnelConfig, local_index: u32) -> Result<Self> {
        config.validate()?;

        let pool = PacketBufferPool::new(PacketBufferPoolConfig {
            buffer_size: config.buffer_size,
            max_pooled: config.max_pooled_buffers,
            starting_pooled: config.starting_pooled_buffers,
        });
        let counters = Arc::new(SessionCounters::default());

        let outbound = {
            let pool = pool.clone();
            let counters = counters.clone();
            OrderedPipeline::new(
                PipelineConfig::new("seal", config.pipeline_capacity, config.worker_count),
                move |job: &OutboundJob| seal_job(&pool, job),
                move |result, _job| record_sealed(&counters, result),
            )?
        };

        let inbound = {
            let pool = pool.clone();
            let counters = counters.clone();
            OrderedPipeline::new(
                PipelineConfig::new("open", config.pipeline_capacity, config.worker_count),
                move |job: &InboundJob| open_job(&pool, job),
                move |result, job: InboundJob| record_opened(&counters, result, job.counter),
            )?
        };

        debug!(local_index, "peer session created");

        Ok(Self {
            local_index,
            replay_protection: config.replay_protection,
            replay_window: config.replay_window,
            pool,
            active: RwLock::new(None),
            counters,
            outbound,
            inbound,
        })
    }

    /// Receiver index the peer puts in messages addressed to us.
    pub fn local_index(&self) -> u32 {
        self.local_index
    }

    /// Receiver index we put in messages to the peer.
    pub fn remote_index(&self) -> Option<u32> {
        self.active.read().as_ref().map(|a| a.remote_index)
    }

    pub fn has_keypair(&self) -> bool {
        self.active.read().is_some()
    }

    /// Largest plaintext packet whose transport message still fits in one
    /// pool buffer, and so in the peer's receive buffer.
    pub fn max_packet_size(&self) -> usize {
        self.pool.buffer_size().saturating_sub(MIN_TRANSPORT_MESSAGE_SIZE)
    }

    pub fn pool(&self) -> &PacketBufferPool {
        &self.pool
    }

    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Make `keypair` the active keypair. The previous one is retired.
    pub fn install_keypair(&self, keypair: SymmetricKeypair, remote_index: u32) -> Result<()> {
        let replay = if self.replay_protection {
            Some(Arc::new(Mutex::new(ReplayWindow::new(self.replay_window)?)))
        } else {
            None
        };

        let fingerprint = keypair.fingerprint().to_string();
        let previous = self.active.write().replace(ActiveKeypair {
            keypair: Arc::new(keypair),
            remote_index,
            replay,
        });

        match previous {
            Some(old) => {
                old.keypair.retire();
                info!(
                    old = old.keypair.fingerprint(),
                    new = %fingerprint,
                    remote_index,
                    "session rekeyed"
                );
            }
            None => info!(keypair = %fingerprint, remote_index, "session keypair installed"),
        }
        Ok(())
    }

    /// Whether the active keypair has hit a rekey threshold.
    pub fn needs_rekey(&self) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|a| a.keypair.needs_rekey())
    }

    fn current(&self) -> Result<ActiveKeypair> {
        match self.active.read().as_ref() {
            Some(active) => Ok(active.clone()),
            None => {
                bump(&self.counters.dropped_no_session, 1);
                debug!("dropping packet, no keypair installed");
                Err(SessionError::NoSession)
            }
        }
    }

    /// Queue `packet` to be sealed, blocking while the seal pipeline is full.
    ///
    /// Returns the pipeline sequence number; the sealed message comes out of
    /// [`next_outbound`](Self::next_outbound) in the same order.
    ///
    /// Packets larger than [`max_packet_size`](Self::max_packet_size) are
    /// rejected with [`CoreError::Capacity`].
    pub fn submit_outbound<P: L3Packet + 'static>(&self, packet: P) -> Result<u64> {
        let size = packet.size();
        let available = self.max_packet_size();
        if size > available {
            bump(&self.counters.dropped_oversize, 1);
            debug!(size, available, "dropping oversize outbound packet");
            return Err(CoreError::Capacity {
                requested: size,
                available,
            }
            .into());
        }
        let active = self.current()?;
        self.outbound
            .enqueue(OutboundJob {
                packet: Box::new(packet),
                active,
            })
            .map_err(SessionError::from)
    }

    /// Queue an empty transport message.
    pub fn send_keepalive(&self) -> Result<u64> {
        let seq = self.submit_outbound(Keepalive)?;
        bump(&self.counters.keepalives_sent, 1);
        trace!(seq, "keepalive queued");
        Ok(seq)
    }

    /// Queue a sealed payload (ciphertext then tag) received with `counter`.
    pub fn submit_inbound(&self, counter: u64, sealed: &[u8]) -> Result<u64> {
        let active = self.current()?;
        let job = InboundJob {
            counter,
            message: self.copy_to_pool(sealed),
            offset: 0,
            active,
        };
        self.inbound.enqueue(job).map_err(SessionError::from)
    }

    /// Like [`submit_inbound`](Self::submit_inbound) but drops the payload
    /// instead of waiting when the open pipeline is full.
    pub fn try_submit_inbound(&self, counter: u64, sealed: &[u8]) -> Result<u64> {
        let active = self.current()?;
        let job = InboundJob {
            counter,
            message: self.copy_to_pool(sealed),
            offset: 0,
            active,
        };
        match self.inbound.try_enqueue(job) {
            Ok(seq) => Ok(seq),
            Err(TryEnqueueError::Full(_)) => {
                bump(&self.counters.dropped_full, 1);
                debug!(counter, "dropping inbound packet, pipeline full");
                Err(SessionError::Full)
            }
            Err(TryEnqueueError::Cancelled(_)) => Err(SessionError::Cancelled),
        }
    }

    /// Queue a complete transport message as received from the socket.
    pub fn submit_datagram(&self, message: &[u8]) -> Result<u64> {
        self.submit_datagram_packet(self.copy_to_pool(message))
    }

    /// Queue a complete transport message already held in a pooled buffer.
    pub fn submit_datagram_packet(&self, message: PooledPacket) -> Result<u64> {
        let header = match TransportHeader::parse(message.as_slice()) {
            Ok(header) => header,
            Err(e) => {
                bump(&self.counters.invalid_messages, 1);
                debug!("dropping invalid transport message: {}", e);
                return Err(e.into());
            }
        };
        if header.receiver_index != self.local_index {
            bump(&self.counters.invalid_messages, 1);
            debug!(
                receiver_index = header.receiver_index,
                "dropping message for another receiver"
            );
            return Err(SessionError::UnknownReceiver(header.receiver_index));
        }

        let active = self.current()?;
        self.inbound
            .enqueue(InboundJob {
                counter: header.counter,
                message,
                offset: TRANSPORT_HEADER_SIZE,
                active,
            })
            .map_err(SessionError::from)
    }

    /// Next sealed message, in submission order.
    pub fn next_outbound(&self) -> Result<SealedMessage> {
        self.outbound.dequeue().map_err(SessionError::from)
    }

    pub fn next_outbound_timeout(&self, timeout: Duration) -> Option<Result<SealedMessage>> {
        self.outbound
            .dequeue_timeout(timeout)
            .map(|r| r.map_err(SessionError::from))
    }

    /// Next opened packet, in submission order.
    pub fn next_inbound(&self) -> Result<OpenedPacket> {
        self.inbound.dequeue().map_err(SessionError::from)
    }

    pub fn next_inbound_timeout(&self, timeout: Duration) -> Option<Result<OpenedPacket>> {
        self.inbound
            .dequeue_timeout(timeout)
            .map(|r| r.map_err(SessionError::from))
    }

    /// Cancel both pipelines and retire the active keypair.
    pub fn shutdown(&self) {
        self.outbound.shutdown();
        self.inbound.shutdown();
        if let Some(active) = self.active.write().take() {
            active.keypair.retire();
            info!(keypair = active.keypair.fingerprint(), "peer session shut down");
        }
    }

    fn copy_to_pool(&self, data: &[u8]) -> PooledPacket {
        let mut packet = self.pool.acquire(data.len());
        packet.as_mut_slice().copy_from_slice(data);
        packet
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn seal_job(pool: &PacketBufferPool, job: &OutboundJob) -> Result<SealedMessage> {
    let size = job.packet.size();
    let mut message = pool.acquire(sealed_message_len(size));
    let buf = message.as_mut_slice();

    write_packet(
        &*job.packet,
        &mut buf[TRANSPORT_HEADER_SIZE..TRANSPORT_HEADER_SIZE + size],
    )?;
    let counter = job
        .active
        .keypair
        .seal_in_place(&mut buf[TRANSPORT_HEADER_SIZE..], size)?;
    TransportHeader::new(job.active.remote_index, counter).write_into(buf)?;

    Ok(SealedMessage {
        counter,
        receiver_index: job.active.remote_index,
        message,
    })
}

fn open_job(pool: &PacketBufferPool, job: &InboundJob) -> Result<OpenedPacket> {
    let sealed = &job.message.as_slice()[job.offset..];
    let mut out = pool.acquire(sealed.len());
    let len = job.active.keypair.open(job.counter, sealed, out.as_mut_slice())?;

    // Only authenticated counters may move the window.
    if let Some(replay) = &job.active.replay {
        if !replay.lock().check_and_update(job.counter) {
            return Err(SessionError::Replay(job.counter));
        }
    }

    Ok(OpenedPacket {
        counter: job.counter,
        packet: PooledPacket::new(len, out.into_backing())?,
    })
}

fn record_sealed(
    counters: &SessionCounters,
    result: &std::result::Result<SealedMessage, PipelineError<SessionError>>,
) {
    match result {
        Ok(message) => {
            bump(&counters.packets_sealed, 1);
            bump(&counters.bytes_sealed, message.len() as u64);
        }
        Err(PipelineError::Transform(e)) => {
            bump(&counters.seal_failures, 1);
            warn!("failed to seal outbound packet: {}", e);
        }
        Err(_) => {}
    }
}

fn record_opened(
    counters: &SessionCounters,
    result: &std::result::Result<OpenedPacket, PipelineError<SessionError>>,
    counter: u64,
) {
    match result {
        Ok(packet) if packet.is_keepalive() => {
            bump(&counters.packets_opened, 1);
            bump(&counters.keepalives_received, 1);
            trace!(counter, "keepalive received");
        }
        Ok(packet) => {
            bump(&counters.packets_opened, 1);
            bump(&counters.bytes_opened, packet.as_slice().len() as u64);
        }
        Err(PipelineError::Transform(SessionError::Crypto(CryptoError::AuthenticationFailure))) => {
            bump(&counters.auth_failures, 1);
            debug!(counter, "dropping packet with invalid authentication tag");
        }
        Err(PipelineError::Transform(SessionError::Replay(_))) => {
            bump(&counters.replays_rejected, 1);
            debug!(counter, "dropping replayed packet");
        }
        Err(PipelineError::Transform(SessionError::Crypto(CryptoError::Retired))) => {
            debug!(counter, "dropping packet for retired keypair");
        }
        Err(PipelineError::Transform(e)) => warn!(counter, "failed to open inbound packet: {}", e),
        Err(_) => {}
    }
}
