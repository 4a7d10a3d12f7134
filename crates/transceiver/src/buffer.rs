//! Reference-counted buffers obtained from a pool.
//!
//! The spec treats memory pools as an external collaborator: something that
//! hands out fixed-capacity byte buffers and reference-counted packets, and
//! reclaims them once every holder has dropped its reference. [`BufferPool`]
//! and [`PacketPool`] are the traits the core consumes; [`DefaultBufferPool`]
//! and [`DefaultPacketPool`] are minimal, genuinely-recycling implementations
//! usable standalone or in tests — a real deployment may supply its own.

use std::sync::Arc;

use crossbeam::queue::SegQueue;

use crate::address::Address;

struct BufferInner {
    data: Vec<u8>,
    len: usize,
    recycle: Arc<SegQueue<Vec<u8>>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.recycle.push(data);
    }
}

/// A fixed-capacity byte buffer shared between the connection's read stream
/// (or a received packet) and any collaborator that retains it.
///
/// Cloning an `RcBuffer` is cheap (an `Arc` clone); the backing allocation is
/// returned to its pool once the last clone is dropped.
#[derive(Clone)]
pub struct RcBuffer(Arc<BufferInner>);

impl RcBuffer {
    pub fn as_slice(&self) -> &[u8] {
        &self.0.data[..self.0.len]
    }

    pub fn len(&self) -> usize {
        self.0.len
    }

    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }
}

impl std::fmt::Debug for RcBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RcBuffer").field("len", &self.len()).finish()
    }
}

/// An exclusively-owned buffer checked out of a pool, not yet shared.
///
/// The I/O driver fills it in place (e.g. via `recv_from`/`read`) and then
/// calls [`PoolBuf::freeze`] to turn it into a shareable [`RcBuffer`]. If it
/// is dropped without being frozen (e.g. the read failed), its backing
/// allocation is returned to the pool unused.
pub struct PoolBuf {
    data: Vec<u8>,
    recycle: Arc<SegQueue<Vec<u8>>>,
}

impl PoolBuf {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Consumes the buffer, keeping only the first `len` bytes as valid
    /// content, and returns a shareable handle to it.
    pub fn freeze(mut self, len: usize) -> RcBuffer {
        debug_assert!(len <= self.data.len());
        let data = std::mem::take(&mut self.data);
        let recycle = Arc::clone(&self.recycle);
        std::mem::forget(self);
        RcBuffer(Arc::new(BufferInner { data, len, recycle }))
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if data.capacity() > 0 {
            self.recycle.push(data);
        }
    }
}

/// A pool of fixed-capacity byte buffers. Implementations must be safe to
/// call from the event loop thread; `acquire` must not block.
pub trait BufferPool: Send + Sync {
    fn acquire(&self) -> PoolBuf;
}

/// A `BufferPool` that recycles its backing allocations through a lock-free
/// free list rather than allocating afresh on every call.
pub struct DefaultBufferPool {
    capacity: usize,
    free: Arc<SegQueue<Vec<u8>>>,
}

impl DefaultBufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Arc::new(SegQueue::new()),
        }
    }
}

impl BufferPool for DefaultBufferPool {
    fn acquire(&self) -> PoolBuf {
        let mut data = self.free.pop().unwrap_or_default();
        data.clear();
        data.resize(self.capacity, 0);
        PoolBuf {
            data,
            recycle: Arc::clone(&self.free),
        }
    }
}

/// A received (or about-to-be-sent) UDP datagram: the addresses involved plus
/// its payload.
#[derive(Clone, Debug)]
pub struct Packet {
    src: Address,
    dst: Address,
    payload: RcBuffer,
}

impl Packet {
    pub fn new(src: Address, dst: Address, payload: RcBuffer) -> Self {
        Self { src, dst, payload }
    }

    pub fn src(&self) -> Address {
        self.src
    }

    pub fn dst(&self) -> Address {
        self.dst
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }
}

/// A pool of datagram-sized buffers, used to build [`Packet`]s.
pub trait PacketPool: Send + Sync {
    fn acquire(&self) -> PoolBuf;
}

/// A `PacketPool` backed by a [`DefaultBufferPool`].
pub struct DefaultPacketPool(DefaultBufferPool);

impl DefaultPacketPool {
    pub fn new(max_datagram_size: usize) -> Self {
        Self(DefaultBufferPool::new(max_datagram_size))
    }
}

impl PacketPool for DefaultPacketPool {
    fn acquire(&self) -> PoolBuf {
        self.0.acquire()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_is_recycled_after_last_reference_drops() {
        let pool = DefaultBufferPool::new(16);
        assert_eq!(pool.free.len(), 0);

        let mut buf = pool.acquire();
        buf.as_mut_slice()[0] = 42;
        let shared = buf.freeze(1);
        let shared2 = shared.clone();

        assert_eq!(shared.as_slice(), &[42]);
        drop(shared);
        assert_eq!(pool.free.len(), 0, "still one live reference");

        drop(shared2);
        assert_eq!(pool.free.len(), 1, "allocation returned to the pool");
    }

    #[test]
    fn unfrozen_buffer_is_returned_on_drop() {
        let pool = DefaultBufferPool::new(16);
        let buf = pool.acquire();
        drop(buf);
        assert_eq!(pool.free.len(), 1);
    }

    #[test]
    fn packet_exposes_addresses_and_payload() {
        use crate::address::Family;

        let pool = DefaultPacketPool::new(64);
        let mut buf = pool.acquire();
        buf.as_mut_slice()[..3].copy_from_slice(b"abc");
        let payload = buf.freeze(3);

        let src = Address::new(Family::Auto, "10.0.0.1", 1000).unwrap();
        let dst = Address::new(Family::Auto, "10.0.0.2", 2000).unwrap();
        let packet = Packet::new(src, dst, payload);

        assert_eq!(packet.src(), src);
        assert_eq!(packet.dst(), dst);
        assert_eq!(packet.payload(), b"abc");
    }
}
