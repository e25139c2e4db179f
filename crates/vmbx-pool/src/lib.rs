//! Announced frame buffer pool and capture queue.
//!
//! A capture session owns a fixed number of frame buffers. Each buffer moves
//! through a small state machine while the session runs:
//!
//! ```text
//! Idle --announce--> Announced --enqueue--> Queued --fill--> Filled
//!                        ^                     ^                |
//!                        |                     +----requeue-----+
//!                        +--flush--------------+
//! Announced --revoke--> Idle
//! ```
//!
//! - [`FrameQueue<T>`]: the per-session pool. The producer (transport) waits
//!   on [`FrameQueue::next_for_capture`], which stalls while no buffer is
//!   queued. The consumer pulls with [`FrameQueue::dequeue_completed`].
//! - [`CaptureSlot<T>`]: producer-side guard. A slot dropped without
//!   [`CaptureSlot::complete`] goes straight back to the capture queue.
//! - [`Completed<T>`]: consumer-side guard. Dropping it requeues the buffer
//!   for capture, so every delivered buffer is requeued exactly once.
//! - [`PayloadPool`]: memory owned by the transport, used when the session
//!   runs with [`AllocationMode::TransportAllocates`].
//!
//! # Bounded outstanding buffers
//!
//! The number of buffers in `Queued` plus `Filled` never exceeds the capacity
//! given to [`FrameQueue::new`]. Announcing beyond it fails with
//! [`PoolError::CapacityReached`].
//!
//! # Example
//!
//! ```
//! use vmbx_pool::{AllocationMode, FrameQueue};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let queue = FrameQueue::new(AllocationMode::ApplicationAllocates, 2).unwrap();
//! let handle = queue.announce(vec![0u8; 64], AllocationMode::ApplicationAllocates).unwrap();
//! queue.enqueue(handle).unwrap();
//!
//! // Producer side
//! let mut slot = queue.next_for_capture().await.unwrap();
//! slot[0] = 7;
//! slot.complete();
//!
//! // Consumer side; dropping the guard requeues the buffer
//! let frame = queue.dequeue_completed(Duration::from_millis(10)).await.unwrap();
//! assert_eq!(frame[0], 7);
//! drop(frame);
//! assert_eq!(queue.queued_count(), 1);
//! # });
//! ```

pub mod payload;

pub use payload::{PayloadBuffer, PayloadPool};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Who supplies the memory behind the buffers of one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationMode {
    /// The application allocates buffers and announces them.
    ApplicationAllocates,
    /// The transport supplies and owns buffers; the pool only tracks handles.
    TransportAllocates,
}

impl AllocationMode {
    /// Short label used in logs and configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationAllocates => "application",
            Self::TransportAllocates => "transport",
        }
    }
}

impl std::fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Not announced (never announced, or revoked).
    Idle,
    /// Known to the pool but not queued for capture.
    Announced,
    /// Waiting for, or currently receiving, frame data.
    Queued,
    /// Holding a completed frame, either waiting for or held by a consumer.
    Filled,
}

/// Opaque handle to an announced buffer.
///
/// Handles carry a generation so a handle kept after `revoke` cannot address
/// a buffer announced later into the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle {
    index: usize,
    generation: u32,
}

impl BufferHandle {
    /// Slot index (for logging and metrics).
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Errors raised by [`FrameQueue`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// A session needs at least one buffer.
    #[error("frame queue capacity must be greater than 0")]
    ZeroCapacity,

    /// Announcing would exceed the configured buffer count.
    #[error("all {capacity} buffer slots are announced")]
    CapacityReached {
        /// Configured capacity.
        capacity: usize,
    },

    /// A buffer's origin differs from the session's allocation mode.
    #[error("buffer allocated by {buffer} cannot join a session where {session} allocates")]
    ModeMismatch {
        /// Allocation mode of the session.
        session: AllocationMode,
        /// Origin of the announced buffer.
        buffer: AllocationMode,
    },

    /// The handle does not address a live buffer.
    #[error("unknown buffer handle (slot {0})")]
    UnknownHandle(usize),

    /// The buffer is not in the state the operation requires.
    #[error("buffer in slot {index} is {state:?}, expected {expected:?}")]
    WrongState {
        /// Slot index.
        index: usize,
        /// Current state.
        state: BufferState,
        /// State required by the operation.
        expected: BufferState,
    },

    /// The buffer is currently held by a producer or consumer guard.
    #[error("buffer in slot {0} is on loan")]
    OnLoan(usize),

    /// No completed frame arrived within the timeout.
    #[error("no completed frame within {0:?}")]
    Timeout(Duration),

    /// Internal queue and permit bookkeeping disagree.
    #[error("capture queue bookkeeping out of sync")]
    Desync,
}

/// Result of revoking every buffer of a session.
#[derive(Debug)]
pub struct Revoked<T> {
    /// Buffers returned to the caller.
    pub buffers: Vec<T>,
    /// Buffers still on loan; they are dropped when their guard returns.
    pub pending: usize,
}

struct Slot<T> {
    generation: u32,
    state: BufferState,
    item: Option<T>,
    on_loan: bool,
    revoke_pending: bool,
}

impl<T> Slot<T> {
    fn idle() -> Self {
        Self {
            generation: 0,
            state: BufferState::Idle,
            item: None,
            on_loan: false,
            revoke_pending: false,
        }
    }
}

/// Bounded pool of announced buffers with a capture queue and a completion queue.
///
/// Uses two semaphores: `queued` counts buffers waiting for the producer,
/// `filled` counts completed buffers waiting for a consumer. Slot bookkeeping
/// sits behind a short-held mutex that is never held across an `.await`.
pub struct FrameQueue<T> {
    mode: AllocationMode,
    capacity: usize,
    slots: Mutex<Vec<Slot<T>>>,
    capture_order: SegQueue<usize>,
    completed_order: SegQueue<usize>,
    queued: Semaphore,
    filled: Semaphore,
    total_fills: AtomicU64,
    total_requeues: AtomicU64,
}

impl<T: Send + 'static> FrameQueue<T> {
    /// Create an empty queue for a session with `capacity` buffers.
    pub fn new(mode: AllocationMode, capacity: usize) -> Result<Arc<Self>, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }

        debug!(mode = %mode, capacity, "FrameQueue created");

        Ok(Arc::new(Self {
            mode,
            capacity,
            slots: Mutex::new(Vec::with_capacity(capacity)),
            capture_order: SegQueue::new(),
            completed_order: SegQueue::new(),
            queued: Semaphore::new(0),
            filled: Semaphore::new(0),
            total_fills: AtomicU64::new(0),
            total_requeues: AtomicU64::new(0),
        }))
    }

    /// Announce a buffer to the session. The buffer starts out `Announced`.
    pub fn announce(&self, item: T, origin: AllocationMode) -> Result<BufferHandle, PoolError> {
        if origin != self.mode {
            return Err(PoolError::ModeMismatch {
                session: self.mode,
                buffer: origin,
            });
        }

        let mut slots = self.slots.lock();
        let live = slots
            .iter()
            .filter(|s| s.state != BufferState::Idle || s.revoke_pending)
            .count();
        if live >= self.capacity {
            return Err(PoolError::CapacityReached {
                capacity: self.capacity,
            });
        }

        let index = match slots
            .iter()
            .position(|s| s.state == BufferState::Idle && !s.revoke_pending)
        {
            Some(index) => index,
            None => {
                slots.push(Slot::idle());
                slots.len() - 1
            }
        };

        let slot = &mut slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.state = BufferState::Announced;
        slot.item = Some(item);
        slot.on_loan = false;

        Ok(BufferHandle {
            index,
            generation: slot.generation,
        })
    }

    /// Revoke an announced buffer and hand it back to its owner.
    ///
    /// Only `Announced` buffers can be revoked; flush queued buffers first.
    pub fn revoke(&self, handle: BufferHandle) -> Result<T, PoolError> {
        let mut slots = self.slots.lock();
        let slot = Self::slot_mut(&mut slots, handle)?;
        if slot.on_loan {
            return Err(PoolError::OnLoan(handle.index));
        }
        if slot.state != BufferState::Announced {
            return Err(PoolError::WrongState {
                index: handle.index,
                state: slot.state,
                expected: BufferState::Announced,
            });
        }
        slot.state = BufferState::Idle;
        slot.item.take().ok_or(PoolError::Desync)
    }

    /// Queue an announced buffer for capture.
    pub fn enqueue(&self, handle: BufferHandle) -> Result<(), PoolError> {
        {
            let mut slots = self.slots.lock();
            let slot = Self::slot_mut(&mut slots, handle)?;
            if slot.state != BufferState::Announced {
                return Err(PoolError::WrongState {
                    index: handle.index,
                    state: slot.state,
                    expected: BufferState::Announced,
                });
            }
            slot.state = BufferState::Queued;
        }
        self.capture_order.push(handle.index);
        self.queued.add_permits(1);
        Ok(())
    }

    /// Wait for a queued buffer to fill.
    ///
    /// Stalls until a buffer is queued; pool exhaustion never fails here.
    pub async fn next_for_capture(self: &Arc<Self>) -> Result<CaptureSlot<T>, PoolError> {
        let permit = self.queued.acquire().await.map_err(|_| PoolError::Desync)?;
        permit.forget();
        self.take_for_capture()
    }

    /// Like [`next_for_capture`](Self::next_for_capture) but gives up after `timeout`.
    ///
    /// Returns `None` on timeout and logs the stall.
    pub async fn next_for_capture_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Option<CaptureSlot<T>> {
        let permit = match tokio::time::timeout(timeout, self.queued.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return None,
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis(),
                    capacity = self.capacity,
                    completed = self.completed_count(),
                    "No buffer queued for capture - consumer is holding every frame"
                );
                return None;
            }
        };
        permit.forget();
        self.take_for_capture().ok()
    }

    fn take_for_capture(self: &Arc<Self>) -> Result<CaptureSlot<T>, PoolError> {
        let index = self.capture_order.pop().ok_or(PoolError::Desync)?;
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(PoolError::Desync)?;
        slot.on_loan = true;
        let item = slot.item.take().ok_or(PoolError::Desync)?;
        Ok(CaptureSlot {
            queue: Arc::clone(self),
            handle: BufferHandle {
                index,
                generation: slot.generation,
            },
            item: Some(item),
            completed: false,
        })
    }

    /// Wait up to `timeout` for a completed frame.
    pub async fn dequeue_completed(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Completed<T>, PoolError> {
        let permit = match tokio::time::timeout(timeout, self.filled.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Desync),
            Err(_) => return Err(PoolError::Timeout(timeout)),
        };
        permit.forget();
        self.take_completed()
    }

    /// Wait without bound for a completed frame.
    pub async fn next_completed(self: &Arc<Self>) -> Result<Completed<T>, PoolError> {
        let permit = self.filled.acquire().await.map_err(|_| PoolError::Desync)?;
        permit.forget();
        self.take_completed()
    }

    /// Take a completed frame if one is ready.
    #[must_use]
    pub fn try_dequeue_completed(self: &Arc<Self>) -> Option<Completed<T>> {
        let permit = self.filled.try_acquire().ok()?;
        permit.forget();
        self.take_completed().ok()
    }

    fn take_completed(self: &Arc<Self>) -> Result<Completed<T>, PoolError> {
        let index = self.completed_order.pop().ok_or(PoolError::Desync)?;
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(PoolError::Desync)?;
        slot.on_loan = true;
        let item = slot.item.take().ok_or(PoolError::Desync)?;
        Ok(Completed {
            queue: Arc::clone(self),
            handle: BufferHandle {
                index,
                generation: slot.generation,
            },
            item: Some(item),
        })
    }

    /// Move every completed-but-undelivered frame back to the capture queue.
    ///
    /// Returns the number of frames discarded this way.
    pub fn flush_completed(&self) -> usize {
        let mut moved = 0;
        while let Ok(permit) = self.filled.try_acquire() {
            permit.forget();
            let Some(index) = self.completed_order.pop() else {
                break;
            };
            {
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(index) {
                    slot.state = BufferState::Queued;
                }
            }
            self.capture_order.push(index);
            self.queued.add_permits(1);
            moved += 1;
        }
        moved
    }

    /// Pull every queued buffer out of the capture queue, back to `Announced`.
    pub fn flush_queued(&self) -> usize {
        let mut moved = 0;
        while let Ok(permit) = self.queued.try_acquire() {
            permit.forget();
            let Some(index) = self.capture_order.pop() else {
                break;
            };
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(index) {
                slot.state = BufferState::Announced;
            }
            moved += 1;
        }
        moved
    }

    /// Flush both queues and revoke every buffer.
    ///
    /// Buffers still on loan are marked and dropped when their guard returns.
    pub fn revoke_all(&self) -> Revoked<T> {
        self.flush_completed();
        self.flush_queued();

        let mut slots = self.slots.lock();
        let mut buffers = Vec::new();
        let mut pending = 0;
        for slot in slots.iter_mut() {
            if slot.state == BufferState::Idle {
                continue;
            }
            if slot.on_loan {
                slot.revoke_pending = true;
                pending += 1;
                continue;
            }
            slot.state = BufferState::Idle;
            if let Some(item) = slot.item.take() {
                buffers.push(item);
            }
        }
        Revoked { buffers, pending }
    }

    fn slot_mut<'a>(
        slots: &'a mut [Slot<T>],
        handle: BufferHandle,
    ) -> Result<&'a mut Slot<T>, PoolError> {
        match slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation && slot.state != BufferState::Idle => {
                Ok(slot)
            }
            _ => Err(PoolError::UnknownHandle(handle.index)),
        }
    }

    fn finish_capture(&self, handle: BufferHandle, item: T, completed: bool) {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(handle.index) else {
                return;
            };
            slot.on_loan = false;
            if slot.revoke_pending {
                slot.revoke_pending = false;
                slot.state = BufferState::Idle;
                return;
            }
            slot.item = Some(item);
            if completed {
                slot.state = BufferState::Filled;
            }
        }
        if completed {
            self.total_fills.fetch_add(1, Ordering::Relaxed);
            self.completed_order.push(handle.index);
            self.filled.add_permits(1);
        } else {
            self.capture_order.push(handle.index);
            self.queued.add_permits(1);
        }
    }

    fn requeue(&self, handle: BufferHandle, item: T) {
        {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(handle.index) else {
                return;
            };
            slot.on_loan = false;
            if slot.revoke_pending {
                slot.revoke_pending = false;
                slot.state = BufferState::Idle;
                return;
            }
            slot.item = Some(item);
            slot.state = BufferState::Queued;
        }
        self.total_requeues.fetch_add(1, Ordering::Relaxed);
        self.capture_order.push(handle.index);
        self.queued.add_permits(1);
    }

    /// Current state of the buffer behind `handle`.
    #[must_use]
    pub fn state(&self, handle: BufferHandle) -> BufferState {
        let slots = self.slots.lock();
        match slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot.state,
            _ => BufferState::Idle,
        }
    }

    /// Number of buffers in `Queued` or `Filled`.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| matches!(s.state, BufferState::Queued | BufferState::Filled))
            .count()
    }

    /// Number of announced (non-idle) buffers.
    #[must_use]
    pub fn announced(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.state != BufferState::Idle)
            .count()
    }

    /// Buffers waiting in the capture queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.queued.available_permits()
    }

    /// Completed frames waiting for a consumer.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.filled.available_permits()
    }

    /// Configured buffer count.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocation mode shared by every buffer of the session.
    #[must_use]
    pub fn mode(&self) -> AllocationMode {
        self.mode
    }

    /// Frames completed since the queue was created.
    #[must_use]
    pub fn total_fills(&self) -> u64 {
        self.total_fills.load(Ordering::Relaxed)
    }

    /// Consumer requeues since the queue was created.
    #[must_use]
    pub fn total_requeues(&self) -> u64 {
        self.total_requeues.load(Ordering::Relaxed)
    }
}

/// Producer-side loan of a queued buffer.
///
/// Call [`complete`](Self::complete) once the frame data is in place. Dropping
/// the slot without completing it puts the buffer back into the capture queue.
pub struct CaptureSlot<T: Send + 'static> {
    queue: Arc<FrameQueue<T>>,
    handle: BufferHandle,
    item: Option<T>,
    completed: bool,
}

impl<T: Send + 'static> CaptureSlot<T> {
    /// Handle of the buffer being filled.
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Hand the filled buffer to the completion queue.
    pub fn complete(mut self) {
        self.completed = true;
        // Drop does the bookkeeping.
    }
}

impl<T: Send + 'static> Deref for CaptureSlot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("capture slot item taken before drop"),
        }
    }
}

impl<T: Send + 'static> DerefMut for CaptureSlot<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("capture slot item taken before drop"),
        }
    }
}

impl<T: Send + 'static> Drop for CaptureSlot<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.finish_capture(self.handle, item, self.completed);
        }
    }
}

/// Consumer-side loan of a completed buffer.
///
/// The buffer is requeued for capture when the guard drops. Call
/// [`requeue`](Self::requeue) to release it early and explicitly.
pub struct Completed<T: Send + 'static> {
    queue: Arc<FrameQueue<T>>,
    handle: BufferHandle,
    item: Option<T>,
}

impl<T: Send + 'static> Completed<T> {
    /// Handle of the completed buffer.
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Return the buffer to the capture queue now.
    pub fn requeue(self) {}

    /// The queue this buffer belongs to.
    #[must_use]
    pub fn queue(&self) -> &Arc<FrameQueue<T>> {
        &self.queue
    }
}

impl<T: Send + 'static> Deref for Completed<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("completed item taken before drop"),
        }
    }
}

impl<T: Send + 'static> DerefMut for Completed<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("completed item taken before drop"),
        }
    }
}

impl<T: Send + 'static> Drop for Completed<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.requeue(self.handle, item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: AllocationMode = AllocationMode::ApplicationAllocates;

    fn queue_with(count: usize) -> (Arc<FrameQueue<Vec<u8>>>, Vec<BufferHandle>) {
        let queue = FrameQueue::new(APP, count).unwrap();
        let handles = (0..count)
            .map(|_| {
                let h = queue.announce(vec![0u8; 16], APP).unwrap();
                queue.enqueue(h).unwrap();
                h
            })
            .collect();
        (queue, handles)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            FrameQueue::<Vec<u8>>::new(APP, 0).err(),
            Some(PoolError::ZeroCapacity)
        );
    }

    #[test]
    fn test_announce_respects_capacity() {
        let queue = FrameQueue::new(APP, 2).unwrap();
        queue.announce(vec![0u8], APP).unwrap();
        queue.announce(vec![0u8], APP).unwrap();
        assert_eq!(
            queue.announce(vec![0u8], APP),
            Err(PoolError::CapacityReached { capacity: 2 })
        );
    }

    #[test]
    fn test_mode_mismatch() {
        let queue = FrameQueue::new(APP, 1).unwrap();
        let err = queue
            .announce(vec![0u8], AllocationMode::TransportAllocates)
            .unwrap_err();
        assert!(matches!(err, PoolError::ModeMismatch { .. }));
    }

    #[test]
    fn test_state_transitions() {
        let queue = FrameQueue::new(APP, 1).unwrap();
        let h = queue.announce(vec![1u8, 2, 3], APP).unwrap();
        assert_eq!(queue.state(h), BufferState::Announced);
        queue.enqueue(h).unwrap();
        assert_eq!(queue.state(h), BufferState::Queued);
        assert_eq!(queue.flush_queued(), 1);
        assert_eq!(queue.state(h), BufferState::Announced);
        assert_eq!(queue.revoke(h).unwrap(), vec![1u8, 2, 3]);
        assert_eq!(queue.state(h), BufferState::Idle);
    }

    #[test]
    fn test_revoke_queued_buffer_fails() {
        let (queue, handles) = queue_with(1);
        assert!(matches!(
            queue.revoke(handles[0]),
            Err(PoolError::WrongState { .. })
        ));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let queue = FrameQueue::new(APP, 1).unwrap();
        let old = queue.announce(vec![0u8], APP).unwrap();
        queue.revoke(old).unwrap();
        let _new = queue.announce(vec![1u8], APP).unwrap();
        assert_eq!(queue.enqueue(old), Err(PoolError::UnknownHandle(0)));
    }

    #[tokio::test]
    async fn test_fill_and_requeue_on_drop() {
        let (queue, handles) = queue_with(1);

        let mut slot = queue.next_for_capture().await.unwrap();
        slot[0] = 42;
        slot.complete();
        assert_eq!(queue.state(handles[0]), BufferState::Filled);

        let frame = queue
            .dequeue_completed(Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(frame[0], 42);
        drop(frame);

        assert_eq!(queue.state(handles[0]), BufferState::Queued);
        assert_eq!(queue.total_requeues(), 1);
        assert_eq!(queue.queued_count(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_capture_returns_to_queue() {
        let (queue, handles) = queue_with(1);
        let slot = queue.next_for_capture().await.unwrap();
        drop(slot);
        assert_eq!(queue.state(handles[0]), BufferState::Queued);
        assert_eq!(queue.completed_count(), 0);
        assert_eq!(queue.total_fills(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_timeout() {
        let (queue, _) = queue_with(1);
        let err = queue
            .dequeue_completed(Duration::from_millis(5))
            .await
            .err();
        assert_eq!(err, Some(PoolError::Timeout(Duration::from_millis(5))));
    }

    #[tokio::test]
    async fn test_capture_stalls_when_exhausted() {
        let (queue, _) = queue_with(1);
        let slot = queue.next_for_capture().await.unwrap();
        slot.complete();

        // Nothing queued until the consumer releases its frame.
        assert!(queue
            .next_for_capture_timeout(Duration::from_millis(10))
            .await
            .is_none());

        let frame = queue.try_dequeue_completed().unwrap();
        drop(frame);
        assert!(queue
            .next_for_capture_timeout(Duration::from_millis(10))
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_outstanding_never_exceeds_capacity() {
        let (queue, _) = queue_with(3);
        for _ in 0..10 {
            let slot = queue.next_for_capture().await.unwrap();
            slot.complete();
            assert!(queue.outstanding() <= queue.capacity());
            let frame = queue.try_dequeue_completed().unwrap();
            assert!(queue.outstanding() <= queue.capacity());
            drop(frame);
        }
        assert_eq!(queue.outstanding(), 3);
    }

    #[tokio::test]
    async fn test_flush_completed_discards_frames() {
        let (queue, _) = queue_with(2);
        queue.next_for_capture().await.unwrap().complete();
        queue.next_for_capture().await.unwrap().complete();
        assert_eq!(queue.completed_count(), 2);

        assert_eq!(queue.flush_completed(), 2);
        assert_eq!(queue.completed_count(), 0);
        assert_eq!(queue.queued_count(), 2);
    }

    #[tokio::test]
    async fn test_revoke_all_defers_loaned_buffers() {
        let (queue, handles) = queue_with(2);
        queue.next_for_capture().await.unwrap().complete();
        let held = queue.try_dequeue_completed().unwrap();

        let revoked = queue.revoke_all();
        assert_eq!(revoked.buffers.len(), 1);
        assert_eq!(revoked.pending, 1);

        drop(held);
        assert_eq!(queue.announced(), 0);
        assert!(handles.iter().all(|h| queue.state(*h) == BufferState::Idle));
        assert_eq!(queue.queued_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_order_is_fill_order() {
        let (queue, _) = queue_with(3);
        for n in 1..=3u8 {
            let mut slot = queue.next_for_capture().await.unwrap();
            slot[0] = n;
            slot.complete();
        }
        let mut held = Vec::new();
        while let Some(frame) = queue.try_dequeue_completed() {
            held.push(frame);
        }
        let seen: Vec<u8> = held.iter().map(|f| f[0]).collect();
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_producer_consumer_concurrently() {
        let (queue, _) = queue_with(2);

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                for n in 0..50u8 {
                    let mut slot = queue.next_for_capture().await.unwrap();
                    slot[0] = n;
                    slot.complete();
                }
            })
        };

        for n in 0..50u8 {
            let frame = queue
                .dequeue_completed(Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(frame[0], n);
        }

        producer.await.unwrap();
        assert_eq!(queue.total_fills(), 50);
        assert_eq!(queue.total_requeues(), 50);
    }
}
