//! Pooled packet buffers.
//!
//! Sealing and opening run at packet rate, so the session keeps a pool of
//! fixed-size buffers instead of allocating one per datagram. A buffer taken
//! from the pool is owned by exactly one [`PooledBuffer`] and goes back to
//! the pool when that owner is dropped.
//!
//! Readers never touch the owner directly. [`PooledPacket::view`] hands out a
//! [`PacketView`] with its own position/limit/byte order, so advancing a view
//! cannot disturb the packet or any other view.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::packet::L3Packet;
use crate::CoreError;

#[derive(Debug, Clone)]
pub struct PacketBufferPoolConfig {
    /// Size of each pooled buffer in bytes.
    pub buffer_size: usize,

    /// Maximum number of idle buffers kept for reuse.
    pub max_pooled: usize,

    /// Buffers allocated when the pool is created.
    pub starting_pooled: usize,
}

impl Default for PacketBufferPoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            max_pooled: 4096,
            starting_pooled: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketBufferPoolStats {
    pub allocations: u64,
    pub reuses: u64,
    pub discarded: u64,
    pub available: usize,
}

struct PoolInner {
    config: PacketBufferPoolConfig,
    available: Mutex<Vec<Vec<u8>>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn release(&self, mut data: Vec<u8>) {
        let mut available = self.available.lock();
        if available.len() < self.config.max_pooled {
            data.fill(0);
            available.push(data);
        } else {
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Shared pool of fixed-size packet buffers. Cloning shares the pool.
#[derive(Clone)]
pub struct PacketBufferPool {
    inner: Arc<PoolInner>,
}

impl PacketBufferPool {
    pub fn new(config: PacketBufferPoolConfig) -> Self {
        let starting = config.starting_pooled.min(config.max_pooled);
        let available = (0..starting)
            .map(|_| vec![0u8; config.buffer_size])
            .collect::<Vec<_>>();

        debug!(
            buffer_size = config.buffer_size,
            max_pooled = config.max_pooled,
            starting,
            "packet buffer pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                allocations: AtomicU64::new(starting as u64),
                config,
                available: Mutex::new(available),
                reuses: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.config.buffer_size
    }

    /// Take a full-size buffer from the pool, allocating if none is idle.
    pub fn acquire_buffer(&self) -> PooledBuffer {
        let reused = self.inner.available.lock().pop();
        let data = match reused {
            Some(data) => {
                self.inner.reuses.fetch_add(1, Ordering::Relaxed);
                data
            }
            None => {
                self.inner.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.inner.config.buffer_size]
            }
        };

        PooledBuffer {
            data,
            pool: Some(self.inner.clone()),
        }
    }

    /// A packet of logical size `needed`.
    ///
    /// Requests larger than the pool's buffer size get a dedicated buffer
    /// that is freed instead of pooled on release.
    pub fn acquire(&self, needed: usize) -> PooledPacket {
        let backing = if needed <= self.inner.config.buffer_size {
            self.acquire_buffer()
        } else {
            warn!(
                needed,
                buffer_size = self.inner.config.buffer_size,
                "oversize packet request, allocating dedicated buffer"
            );
            self.inner.allocations.fetch_add(1, Ordering::Relaxed);
            PooledBuffer::unpooled(vec![0u8; needed])
        };

        PooledPacket {
            size: needed,
            backing,
            order: ByteOrder::BigEndian,
        }
    }

    /// Like [`acquire`](Self::acquire) but fails instead of allocating
    /// outside the pool. Nothing is taken from the pool on failure.
    pub fn try_acquire(&self, needed: usize) -> Result<PooledPacket, CoreError> {
        let available = self.inner.config.buffer_size;
        if needed > available {
            return Err(CoreError::Capacity {
                requested: needed,
                available,
            });
        }
        PooledPacket::new(needed, self.acquire_buffer())
    }

    pub fn stats(&self) -> PacketBufferPoolStats {
        PacketBufferPoolStats {
            allocations: self.inner.allocations.load(Ordering::Relaxed),
            reuses: self.inner.reuses.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
            available: self.inner.available.lock().len(),
        }
    }
}

impl std::fmt::Debug for PacketBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBufferPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive owner of one backing buffer.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: Option<Arc<PoolInner>>,
}

impl PooledBuffer {
    /// A buffer that is simply freed on drop.
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self { data, pool: None }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// A packet of fixed logical size stored in a pooled buffer.
#[derive(Debug)]
pub struct PooledPacket {
    size: usize,
    backing: PooledBuffer,
    order: ByteOrder,
}

impl PooledPacket {
    pub fn new(size: usize, backing: PooledBuffer) -> Result<Self, CoreError> {
        if backing.capacity() < size {
            return Err(CoreError::Capacity {
                requested: size,
                available: backing.capacity(),
            });
        }
        Ok(Self {
            size,
            backing,
            order: ByteOrder::BigEndian,
        })
    }

    pub fn with_order(mut self, order: ByteOrder) -> Self {
        self.order = order;
        self
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.backing.as_slice()[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.backing.as_mut_slice()[..self.size]
    }

    /// An independent read cursor over the packet bytes.
    pub fn view(&self) -> PacketView<'_> {
        PacketView {
            data: self.as_slice(),
            position: 0,
            limit: self.size,
            order: self.order,
        }
    }

    pub fn into_backing(self) -> PooledBuffer {
        self.backing
    }
}

impl L3Packet for PooledPacket {
    fn size(&self) -> usize {
        self.size
    }

    fn write(&self, buf: &mut dyn BufMut) {
        buf.put_slice(self.as_slice());
    }
}

/// Read-only cursor over a [`PooledPacket`].
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    data: &'a [u8],
    position: usize,
    limit: usize,
    order: ByteOrder,
}

impl<'a> PacketView<'a> {
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), CoreError> {
        if position > self.limit {
            return Err(CoreError::OutOfBounds {
                position,
                limit: self.limit,
            });
        }
        self.position = position;
        Ok(())
    }

    /// Shrinks or restores the readable window. The position is clamped.
    pub fn set_limit(&mut self, limit: usize) -> Result<(), CoreError> {
        if limit > self.data.len() {
            return Err(CoreError::OutOfBounds {
                position: limit,
                limit: self.data.len(),
            });
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(())
    }

    pub fn as_slice(&self) -> &'a [u8] {
        &self.data[self.position..self.limit]
    }

    fn ensure(&self, needed: usize) -> Result<(), CoreError> {
        if self.remaining() < needed {
            return Err(CoreError::OutOfBounds {
                position: self.position + needed,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Reads in the view's byte order. Fails without moving the position
    /// when fewer than two bytes remain.
    pub fn read_u16(&mut self) -> Result<u16, CoreError> {
        self.ensure(2)?;
        Ok(match self.order {
            ByteOrder::BigEndian => self.get_u16(),
            ByteOrder::LittleEndian => self.get_u16_le(),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, CoreError> {
        self.ensure(4)?;
        Ok(match self.order {
            ByteOrder::BigEndian => self.get_u32(),
            ByteOrder::LittleEndian => self.get_u32_le(),
        })
    }

    pub fn read_u64(&mut self) -> Result<u64, CoreError> {
        self.ensure(8)?;
        Ok(match self.order {
            ByteOrder::BigEndian => self.get_u64(),
            ByteOrder::LittleEndian => self.get_u64_le(),
        })
    }
}

impl Buf for PacketView<'_> {
    fn remaining(&self) -> usize {
        self.limit - self.position
    }

    fn chunk(&self) -> &[u8] {
        &self.data[self.position..self.limit]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past limit ({cnt} > {})",
            self.remaining()
        );
        self.position += cnt;
    }
}
