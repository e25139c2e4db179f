//! Acquisition engine: buffer announcement, start/stop and frame delivery.
//!
//! ```text
//! Idle --prepare--> Prepared --start--> Acquiring
//!  ^                  |  ^                  |
//!  +---end_capture----+  +-------stop-------+
//! ```
//!
//! Frames reach the application in one of two ways:
//!
//! - **pull**: [`Capture::wait_for_frame`] returns the oldest completed frame;
//! - **push**: a callback registered with [`Capture::register_frame_callback`]
//!   receives every completed frame exactly once, on a blocking worker.
//!
//! Either way the frame is a [`DeliveredFrame`] guard that requeues its buffer
//! when dropped. `stop` waits for callbacks in flight before it returns, and
//! buffers are only revoked by `end_capture`, after `stop`.

use crate::config::CaptureConfig;
use crate::lifecycle::Teardown;
use crate::stream::StreamInner;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use vmbx_core::chunk::ChunkDecoder;
use vmbx_core::frame::{Frame, FrameBuffer};
use vmbx_core::{Result, VmbError};
use vmbx_pool::{AllocationMode, BufferHandle, Completed, FrameQueue};

/// Frame callback. Returning an error is logged and counted; the frame is
/// requeued regardless.
pub type FrameCallback = Arc<dyn Fn(DeliveredFrame) -> Result<()> + Send + Sync>;

/// Lifecycle state of a [`Capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// No buffers announced.
    Idle,
    /// Buffers announced and queued.
    Prepared,
    /// The device produces frames.
    Acquiring,
}

/// Delivery options of a capture session.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOptions {
    /// Decode chunk data of completed frames before delivery.
    pub decode_chunks: bool,
    /// Callbacks allowed to run at the same time. With one worker frames are
    /// delivered strictly in completion order.
    pub delivery_workers: usize,
    /// Timeout of [`Capture::next_frame`].
    pub wait_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for CaptureOptions {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            decode_chunks: config.decode_chunks,
            delivery_workers: config.delivery_workers.max(1),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms),
        }
    }
}

/// Counters of one acquisition run, reset by every `start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameStatistics {
    /// Frames handed to the application.
    pub delivered: u64,
    /// Delivered frames with status `Completed`.
    pub completed: u64,
    /// Delivered frames with any other status.
    pub incomplete: u64,
    /// Gaps in the frame id sequence.
    pub lost: u64,
    /// Completed frames whose chunk data failed to decode.
    pub chunk_errors: u64,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: u64,
    /// Id of the last delivered frame.
    pub last_frame_id: Option<u64>,
}

impl FrameStatistics {
    fn record(&mut self, frame: &Frame, chunk_failed: bool) {
        self.delivered += 1;
        if frame.is_complete() {
            self.completed += 1;
        } else {
            self.incomplete += 1;
        }
        if chunk_failed {
            self.chunk_errors += 1;
        }
        let id = frame.id();
        if let Some(last) = self.last_frame_id {
            if id > last + 1 {
                self.lost += id - last - 1;
            }
        }
        self.last_frame_id = Some(id);
    }
}

/// A completed frame on loan to the application.
///
/// Dropping it requeues the buffer for capture; [`release`](Self::release)
/// does the same explicitly. Chunk data read through
/// [`Frame::chunks`] borrows the guard and cannot outlive it.
pub struct DeliveredFrame {
    frame: Completed<Frame>,
}

impl DeliveredFrame {
    /// Handle of the underlying buffer.
    #[must_use]
    pub fn handle(&self) -> BufferHandle {
        self.frame.handle()
    }

    /// Requeue the buffer now.
    pub fn release(self) {}
}

impl Deref for DeliveredFrame {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        &self.frame
    }
}

impl std::fmt::Debug for DeliveredFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveredFrame")
            .field("handle", &self.handle())
            .field("frame", &*self.frame)
            .finish()
    }
}

/// Decode chunks if wanted and possible, count the frame, wrap it.
fn hand_out(
    mut frame: Completed<Frame>,
    decoder: Option<&ChunkDecoder>,
    stats: &Mutex<FrameStatistics>,
) -> DeliveredFrame {
    let mut chunk_failed = false;
    if let Some(decoder) = decoder {
        if frame.is_complete() && frame.has_chunk_data() {
            if let Err(err) = decoder.prepare(&mut frame) {
                debug!(frame_id = frame.id(), error = %err, "Chunk decoding failed");
                chunk_failed = true;
            }
        }
    }
    if !frame.is_complete() {
        debug!(frame_id = frame.id(), status = %frame.status(), "Frame not completed");
    }
    stats.lock().record(&frame, chunk_failed);
    DeliveredFrame { frame }
}

fn invoke(callback: &FrameCallback, frame: DeliveredFrame, stats: &Mutex<FrameStatistics>, label: &str) {
    let frame_id = frame.id();
    match std::panic::catch_unwind(AssertUnwindSafe(|| callback(frame))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            stats.lock().callback_failures += 1;
            warn!(capture = %label, frame_id, error = %err, "Frame callback failed");
        }
        Err(_) => {
            stats.lock().callback_failures += 1;
            warn!(capture = %label, frame_id, "Frame callback panicked");
        }
    }
}

struct DeliveryContext {
    label: String,
    queue: Arc<FrameQueue<Frame>>,
    callback: FrameCallback,
    decoder: Option<ChunkDecoder>,
    stats: Arc<Mutex<FrameStatistics>>,
    workers: usize,
}

/// Push-mode delivery path. Exits on stop after every callback in flight
/// has returned.
async fn deliver(ctx: DeliveryContext, mut stop: watch::Receiver<bool>) {
    let permits = Arc::new(Semaphore::new(ctx.workers));
    let mut in_flight = JoinSet::new();
    loop {
        let completed = tokio::select! {
            biased;
            _ = stop.changed() => break,
            next = ctx.queue.next_completed() => match next {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(capture = %ctx.label, error = %err, "Completion queue failed");
                    break;
                }
            },
        };
        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let frame = hand_out(completed, ctx.decoder.as_ref(), &ctx.stats);
        let callback = Arc::clone(&ctx.callback);
        let stats = Arc::clone(&ctx.stats);
        let label = ctx.label.clone();
        in_flight.spawn_blocking(move || {
            let _permit = permit;
            invoke(&callback, frame, &stats, &label);
        });
        while let Some(Some(_)) = in_flight.join_next().now_or_never() {}
    }

    let draining = in_flight.len();
    if draining > 0 {
        debug!(capture = %ctx.label, callbacks = draining, "Waiting for callbacks in flight");
    }
    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            warn!(capture = %ctx.label, error = %err, "Callback worker failed");
        }
    }
}

struct Delivery {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub(crate) struct Engine {
    label: String,
    stream: Arc<StreamInner>,
    options: CaptureOptions,
    decoder: Option<ChunkDecoder>,
    ops: tokio::sync::Mutex<()>,
    state: Mutex<EngineState>,
    queue: Mutex<Option<Arc<FrameQueue<Frame>>>>,
    callback: Mutex<Option<FrameCallback>>,
    delivery: Mutex<Option<Delivery>>,
    aborts: watch::Sender<u64>,
    stats: Arc<Mutex<FrameStatistics>>,
    owns_stream: bool,
}

impl Engine {
    fn new(stream: Arc<StreamInner>, options: CaptureOptions, owns_stream: bool) -> Self {
        let decoder = options
            .decode_chunks
            .then(|| ChunkDecoder::new(stream.chunk_layout()));
        let (aborts, _) = watch::channel(0);
        Self {
            label: format!("{} capture", stream.label()),
            stream,
            options,
            decoder,
            ops: tokio::sync::Mutex::new(()),
            state: Mutex::new(EngineState::Idle),
            queue: Mutex::new(None),
            callback: Mutex::new(None),
            delivery: Mutex::new(None),
            aborts,
            stats: Arc::new(Mutex::new(FrameStatistics::default())),
            owns_stream,
        }
    }

    fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn queue(&self) -> Result<Arc<FrameQueue<Frame>>> {
        self.queue
            .lock()
            .clone()
            .ok_or_else(|| VmbError::InvalidState("capture is not prepared".into()))
    }

    async fn prepare(&self, mode: AllocationMode, buffer_count: usize) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stream.ensure_open()?;
        if self.state() != EngineState::Idle {
            return Err(VmbError::InvalidState("capture is already prepared".into()));
        }
        if buffer_count == 0 {
            return Err(VmbError::AllocationError("at least one buffer is required".into()));
        }

        let payload = self.stream.camera_features().read_int("PayloadSize")?;
        let payload = usize::try_from(payload)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| VmbError::AllocationError(format!("invalid PayloadSize {}", payload)))?;

        let queue = FrameQueue::new(mode, buffer_count)?;
        let buffers: Vec<FrameBuffer> = match mode {
            AllocationMode::ApplicationAllocates => (0..buffer_count)
                .map(|_| FrameBuffer::Application(vec![0u8; payload]))
                .collect(),
            AllocationMode::TransportAllocates => self
                .stream
                .device()
                .allocate_buffers(buffer_count, payload)
                .map_err(|err| match err {
                    VmbError::AllocationError(_) => err,
                    other => VmbError::AllocationError(other.to_string()),
                })?
                .into_iter()
                .map(FrameBuffer::Transport)
                .collect(),
        };
        for buffer in buffers {
            let origin = buffer.origin();
            let handle = queue.announce(Frame::new(buffer), origin)?;
            queue.enqueue(handle)?;
        }

        *self.queue.lock() = Some(queue);
        *self.state.lock() = EngineState::Prepared;
        info!(capture = %self.label, %mode, buffers = buffer_count, payload, "Capture prepared");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stream.ensure_open()?;
        match self.state() {
            EngineState::Idle => {
                return Err(VmbError::InvalidState("capture is not prepared".into()))
            }
            EngineState::Acquiring => {
                return Err(VmbError::InvalidState("acquisition is already running".into()))
            }
            EngineState::Prepared => {}
        }
        let queue = self.queue()?;
        *self.stats.lock() = FrameStatistics::default();

        let device = self.stream.device();
        device.start_streaming(Arc::clone(&queue)).await?;

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            let (stop, stop_rx) = watch::channel(false);
            let ctx = DeliveryContext {
                label: self.label.clone(),
                queue: Arc::clone(&queue),
                callback,
                decoder: self.decoder.clone(),
                stats: Arc::clone(&self.stats),
                workers: self.options.delivery_workers.max(1),
            };
            let task = tokio::spawn(deliver(ctx, stop_rx));
            *self.delivery.lock() = Some(Delivery { stop, task });
        }

        if let Err(err) = self.stream.camera_features().run_command("AcquisitionStart") {
            self.halt_delivery().await;
            if let Err(stop_err) = device.stop_streaming().await {
                warn!(capture = %self.label, error = %stop_err, "Failed to stop streaming after failed start");
            }
            queue.flush_completed();
            return Err(err);
        }

        *self.state.lock() = EngineState::Acquiring;
        info!(capture = %self.label, push = self.delivery.lock().is_some(), "Acquisition started");
        Ok(())
    }

    async fn halt_delivery(&self) {
        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            delivery.stop.send_replace(true);
            if let Err(err) = delivery.task.await {
                warn!(capture = %self.label, error = %err, "Delivery task failed");
            }
        }
    }

    async fn stop_locked(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Acquiring {
                return Ok(());
            }
            *state = EngineState::Prepared;
        }
        self.aborts.send_modify(|generation| *generation += 1);

        if let Err(err) = self.stream.camera_features().run_command("AcquisitionStop") {
            warn!(capture = %self.label, error = %err, "AcquisitionStop failed");
        }
        let stopped = self.stream.device().stop_streaming().await;
        self.halt_delivery().await;

        if let Ok(queue) = self.queue() {
            let flushed = queue.flush_completed();
            if flushed > 0 {
                debug!(capture = %self.label, flushed, "Undelivered frames requeued");
            }
        }
        let stats = self.stats.lock().clone();
        info!(
            capture = %self.label,
            delivered = stats.delivered,
            incomplete = stats.incomplete,
            lost = stats.lost,
            callback_failures = stats.callback_failures,
            "Acquisition stopped"
        );
        stopped
    }

    async fn stop(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        self.stop_locked().await
    }

    async fn end_capture(&self) -> Result<()> {
        let _ops = self.ops.lock().await;
        let stopped = self.stop_locked().await;
        let queue = self.queue.lock().take();
        if let Some(queue) = queue {
            let revoked = queue.revoke_all();
            debug!(
                capture = %self.label,
                revoked = revoked.buffers.len(),
                pending = revoked.pending,
                "Buffers revoked"
            );
        }
        *self.state.lock() = EngineState::Idle;
        stopped
    }

    /// `end_capture`, then close the stream if it was opened for this capture.
    async fn release(&self) -> Result<()> {
        let ended = self.end_capture().await;
        if self.owns_stream {
            self.stream.teardown().await?;
        }
        ended
    }

    fn register_callback(&self, callback: FrameCallback) -> Result<()> {
        if self.state() == EngineState::Acquiring {
            return Err(VmbError::InvalidState(
                "cannot change the frame callback while acquiring".into(),
            ));
        }
        *self.callback.lock() = Some(callback);
        Ok(())
    }

    fn unregister_callback(&self) -> Result<bool> {
        if self.state() == EngineState::Acquiring {
            return Err(VmbError::InvalidState(
                "cannot change the frame callback while acquiring".into(),
            ));
        }
        Ok(self.callback.lock().take().is_some())
    }

    async fn wait_for_frame(&self, timeout: Duration) -> Result<DeliveredFrame> {
        let mut aborted = self.aborts.subscribe();
        if self.callback.lock().is_some() {
            return Err(VmbError::InvalidState(
                "frames are delivered to the registered callback".into(),
            ));
        }
        if self.state() != EngineState::Acquiring {
            return Err(VmbError::InvalidState("acquisition is not running".into()));
        }
        let queue = self.queue()?;
        let completed = tokio::select! {
            next = queue.dequeue_completed(timeout) => next?,
            _ = aborted.changed() => return Err(VmbError::Aborted),
        };
        Ok(hand_out(completed, self.decoder.as_ref(), &self.stats))
    }
}

#[async_trait]
impl Teardown for Engine {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn teardown(&self) -> Result<()> {
        self.end_capture().await
    }
}

/// A capture session on one stream.
///
/// Dropping a capture that is not `Idle` ends it in the background.
pub struct Capture {
    engine: Arc<Engine>,
}

impl Capture {
    pub(crate) fn new(stream: Arc<StreamInner>, options: CaptureOptions, owns_stream: bool) -> Self {
        let engine = Arc::new(Engine::new(Arc::clone(&stream), options, owns_stream));
        stream.captures().register(&engine);
        Self { engine }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    /// Options the session was created with.
    #[must_use]
    pub fn options(&self) -> &CaptureOptions {
        &self.engine.options
    }

    /// Announce and queue `buffer_count` buffers of `PayloadSize` bytes.
    ///
    /// `Idle` only. Fails with `AllocationError` when the buffers cannot be
    /// set up; nothing stays announced in that case.
    pub async fn prepare(&self, mode: AllocationMode, buffer_count: usize) -> Result<()> {
        self.engine.prepare(mode, buffer_count).await
    }

    /// Start streaming and run `AcquisitionStart`. `Prepared` only.
    pub async fn start(&self) -> Result<()> {
        self.engine.start().await
    }

    /// Run `AcquisitionStop`, stop streaming and wait for callbacks in flight.
    ///
    /// Pending [`wait_for_frame`](Self::wait_for_frame) calls fail with
    /// `Aborted`. A no-op unless acquiring.
    pub async fn stop(&self) -> Result<()> {
        self.engine.stop().await
    }

    /// Stop if needed and revoke every buffer, back to `Idle`.
    ///
    /// A capture from [`Camera::prepare_capture`](crate::Camera::prepare_capture)
    /// also closes the stream it was prepared on.
    pub async fn end_capture(&self) -> Result<()> {
        self.engine.release().await
    }

    /// Deliver every frame to `callback` from the next `start` on.
    ///
    /// Replaces an earlier callback. Fails with `InvalidState` while acquiring.
    pub fn register_frame_callback<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(DeliveredFrame) -> Result<()> + Send + Sync + 'static,
    {
        self.engine.register_callback(Arc::new(callback))
    }

    /// Return to pull mode. Returns whether a callback was registered.
    pub fn unregister_frame_callback(&self) -> Result<bool> {
        self.engine.unregister_callback()
    }

    /// Wait up to `timeout` for the next completed frame (pull mode).
    pub async fn wait_for_frame(&self, timeout: Duration) -> Result<DeliveredFrame> {
        self.engine.wait_for_frame(timeout).await
    }

    /// [`wait_for_frame`](Self::wait_for_frame) with the configured timeout.
    pub async fn next_frame(&self) -> Result<DeliveredFrame> {
        self.engine.wait_for_frame(self.engine.options.wait_timeout).await
    }

    /// Counters of the current or last run.
    #[must_use]
    pub fn statistics(&self) -> FrameStatistics {
        self.engine.stats.lock().clone()
    }

    /// Buffers announced for this session (0 when `Idle`).
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.engine.queue().map(|q| q.capacity()).unwrap_or(0)
    }

    /// Allocation mode of the prepared session.
    #[must_use]
    pub fn allocation_mode(&self) -> Option<AllocationMode> {
        self.engine.queue().ok().map(|q| q.mode())
    }

    /// Buffers currently `Queued` or `Filled`.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.engine.queue().map(|q| q.outstanding()).unwrap_or(0)
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        let stream_open = self.engine.owns_stream && self.engine.stream.ensure_open().is_ok();
        if self.engine.state() == EngineState::Idle && !stream_open {
            return;
        }
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = engine.release().await {
                        warn!(capture = %engine.label, error = %err, "Capture teardown failed");
                    }
                });
            }
            Err(_) => warn!(capture = %engine.label, "Capture dropped outside a runtime; buffers are released with the stream"),
        }
    }
}

impl std::fmt::Debug for Capture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capture")
            .field("label", &self.engine.label)
            .field("state", &self.state())
            .finish()
    }
}
