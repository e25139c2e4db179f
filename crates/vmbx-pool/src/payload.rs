//! Transport-owned payload memory.
//!
//! With [`AllocationMode::TransportAllocates`](crate::AllocationMode::TransportAllocates)
//! the transport sizes and owns the frame memory. It creates one
//! [`PayloadPool`] per allocation request and lends every buffer of it to the
//! capture session. A [`PayloadBuffer`] goes home when dropped, so revoking a
//! transport buffer from a session hands the memory back to its owner.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

struct Shelf {
    idle: SegQueue<Vec<u8>>,
    payload_size: usize,
    count: usize,
    on_loan: AtomicUsize,
    returned: AtomicU64,
}

impl Shelf {
    fn take_back(&self, mut memory: Vec<u8>) {
        memory.fill(0);
        self.idle.push(memory);
        self.on_loan.fetch_sub(1, Ordering::AcqRel);
        self.returned.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed set of equally sized buffers owned by a transport.
#[derive(Clone)]
pub struct PayloadPool {
    shelf: Arc<Shelf>,
}

impl PayloadPool {
    /// `count` zeroed buffers of `payload_size` bytes. `None` if either is zero.
    #[must_use]
    pub fn new(count: usize, payload_size: usize) -> Option<Self> {
        if count == 0 || payload_size == 0 {
            return None;
        }
        let idle = SegQueue::new();
        for _ in 0..count {
            idle.push(vec![0u8; payload_size]);
        }
        debug!(count, payload_size, total_bytes = count * payload_size, "Payload pool created");
        Some(Self {
            shelf: Arc::new(Shelf {
                idle,
                payload_size,
                count,
                on_loan: AtomicUsize::new(0),
                returned: AtomicU64::new(0),
            }),
        })
    }

    /// Lend one idle buffer, if any.
    #[must_use]
    pub fn try_lend(&self) -> Option<PayloadBuffer> {
        let memory = self.shelf.idle.pop()?;
        self.shelf.on_loan.fetch_add(1, Ordering::AcqRel);
        Some(PayloadBuffer {
            memory,
            home: Arc::clone(&self.shelf),
        })
    }

    /// Lend exactly `count` buffers, or none at all.
    #[must_use]
    pub fn lend(&self, count: usize) -> Option<Vec<PayloadBuffer>> {
        let mut lent = Vec::with_capacity(count);
        for _ in 0..count {
            // Partial loans go back when `lent` drops.
            lent.push(self.try_lend()?);
        }
        Some(lent)
    }

    /// Buffers currently lent out.
    #[must_use]
    pub fn on_loan(&self) -> usize {
        self.shelf.on_loan.load(Ordering::Acquire)
    }

    /// Number of buffers the pool owns.
    #[must_use]
    pub fn count(&self) -> usize {
        self.shelf.count
    }

    /// Size of each buffer in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.shelf.payload_size
    }

    /// Buffers handed back since creation.
    #[must_use]
    pub fn returned(&self) -> u64 {
        self.shelf.returned.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PayloadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadPool")
            .field("count", &self.count())
            .field("payload_size", &self.payload_size())
            .field("on_loan", &self.on_loan())
            .finish()
    }
}

/// A transport buffer on loan. Returns, zeroed, to its pool on drop.
pub struct PayloadBuffer {
    memory: Vec<u8>,
    home: Arc<Shelf>,
}

impl PayloadBuffer {
    /// Whole buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.memory
    }

    /// Whole buffer, writable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// True for a zero-length buffer.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

impl std::fmt::Debug for PayloadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadBuffer").field("len", &self.len()).finish()
    }
}

impl Drop for PayloadBuffer {
    fn drop(&mut self) {
        self.home.take_back(std::mem::take(&mut self.memory));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_pool() {
        assert!(PayloadPool::new(0, 1024).is_none());
        assert!(PayloadPool::new(4, 0).is_none());
        let pool = PayloadPool::new(4, 1024).unwrap();
        assert_eq!((pool.count(), pool.payload_size(), pool.on_loan()), (4, 1024, 0));
    }

    #[test]
    fn test_returned_buffers_are_zeroed() {
        let pool = PayloadPool::new(1, 16).unwrap();
        let mut buffer = pool.try_lend().unwrap();
        buffer.as_mut_slice().fill(0xAB);
        assert_eq!(pool.on_loan(), 1);
        assert!(pool.try_lend().is_none());
        drop(buffer);

        assert_eq!(pool.on_loan(), 0);
        assert_eq!(pool.returned(), 1);
        let buffer = pool.try_lend().unwrap();
        assert_eq!(buffer.len(), 16);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_lend_is_all_or_nothing() {
        let pool = PayloadPool::new(3, 8).unwrap();
        let held = pool.try_lend().unwrap();
        assert!(pool.lend(3).is_none());
        assert_eq!(pool.on_loan(), 1);

        drop(held);
        let all = pool.lend(3).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(pool.on_loan(), 3);
    }
}
