//! Simulated stream: the frame producer.
//!
//! While the camera acquires, the producer takes the next queued buffer,
//! writes the test pattern and the chunk trailer into it and hands it to the
//! completion queue. Frames are paced by the frame rate, or by
//! `TriggerSoftware` when `TriggerMode[FrameStart]` is `On`.

use crate::camera::DeviceState;
use crate::features;
use crate::pattern;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use vmbx_core::chunk::encode_trailer;
use vmbx_core::feature::{Feature, FeatureContainer, Visibility, WeakFeatureContainer};
use vmbx_core::frame::{Frame, FrameHeader, FrameStatus};
use vmbx_core::platform::StreamDevice;
use vmbx_core::{Result, VmbError};
use vmbx_pool::{CaptureSlot, FrameQueue, PayloadBuffer, PayloadPool};

/// Packet size `GVSPAdjustPacketSize` settles on.
const ADJUSTED_PACKET_SIZE: i64 = 8_228;
const PACKET_SIZE_PROBE: Duration = Duration::from_millis(20);

struct Producer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One stream of a [`SimCamera`](crate::SimCamera).
pub struct SimStream {
    state: Arc<DeviceState>,
    index: usize,
    features: FeatureContainer,
    producer: Mutex<Option<Producer>>,
    open: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl SimStream {
    pub(crate) fn new(state: Arc<DeviceState>, index: usize, open: Arc<AtomicBool>) -> Self {
        let features = features::stream(&state.config, index);
        if features.contains("GVSPAdjustPacketSize") {
            let weak = features.downgrade();
            features.insert(
                Feature::command("GVSPAdjustPacketSize")
                    .with_visibility(Visibility::Expert)
                    .with_hook(move |_| adjust_packet_size(&weak)),
            );
        }
        Self {
            state,
            index,
            features,
            producer: Mutex::new(None),
            open,
            closed: AtomicBool::new(false),
        }
    }
}

/// Probe the link and settle on a packet size. Completes asynchronously when
/// a runtime is available.
fn adjust_packet_size(features: &WeakFeatureContainer) -> Result<()> {
    let Some(f) = features.upgrade() else {
        return Err(VmbError::InvalidState("stream is closed".into()));
    };
    let settle = |f: &FeatureContainer| -> Result<()> {
        f.set_device_value("GVSPPacketSize", ADJUSTED_PACKET_SIZE)?;
        f.set_command_done("GVSPAdjustPacketSize", true)
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            f.set_command_done("GVSPAdjustPacketSize", false)?;
            let weak = features.clone();
            handle.spawn(async move {
                tokio::time::sleep(PACKET_SIZE_PROBE).await;
                if let Some(f) = weak.upgrade() {
                    if let Err(err) = settle(&f) {
                        warn!(error = %err, "Packet size adjustment failed");
                    }
                }
            });
            Ok(())
        }
        Err(_) => settle(&f),
    }
}

enum Wake {
    Go,
    Recheck,
    Stop,
}

/// Wait for the next frame slot in time: a trigger or the frame period.
async fn pace(
    state: &DeviceState,
    acquiring: &mut watch::Receiver<bool>,
    stop: &mut watch::Receiver<bool>,
) -> Wake {
    if !*acquiring.borrow_and_update() {
        return tokio::select! {
            _ = stop.changed() => Wake::Stop,
            r = acquiring.changed() => if r.is_err() { Wake::Stop } else { Wake::Recheck },
        };
    }
    if state.trigger_mode() {
        tokio::select! {
            _ = stop.changed() => Wake::Stop,
            r = acquiring.changed() => if r.is_err() { Wake::Stop } else { Wake::Recheck },
            () = state.trigger.notified() => Wake::Go,
        }
    } else {
        tokio::select! {
            _ = stop.changed() => Wake::Stop,
            r = acquiring.changed() => if r.is_err() { Wake::Stop } else { Wake::Recheck },
            () = tokio::time::sleep(state.frame_period()) => Wake::Go,
        }
    }
}

fn bump(features: &FeatureContainer, name: &str) {
    let next = features.read_int(name).unwrap_or(0) + 1;
    if let Err(err) = features.set_device_value(name, next) {
        warn!(feature = name, error = %err, "Failed to update stream statistics");
    }
}

/// Write one frame into `slot`. Returns the frame status.
fn fill(state: &DeviceState, slot: &mut CaptureSlot<Frame>, frame_id: u64) -> Result<FrameStatus> {
    let geometry = state.geometry()?;
    let timestamp = state.now_ns();
    let trailer = encode_trailer(&state.chunk_values(&geometry, frame_id, timestamp));
    let image_size = pattern::image_size(geometry.width, geometry.height, geometry.pixel_format);

    let buf = slot.buffer_mut();
    let written = pattern::fill(
        buf,
        geometry.width,
        geometry.height,
        geometry.pixel_format,
        frame_id,
    )
    .is_some();
    if written && buf.len() >= image_size + trailer.len() {
        buf[image_size..image_size + trailer.len()].copy_from_slice(&trailer);
    }

    let status = if state.rng.chance(state.config.incomplete_rate) {
        FrameStatus::Incomplete
    } else {
        FrameStatus::Completed
    };
    slot.finish(FrameHeader {
        frame_id,
        status,
        width: geometry.width,
        height: geometry.height,
        offset_x: geometry.offset_x,
        offset_y: geometry.offset_y,
        pixel_format: geometry.pixel_format,
        timestamp,
        image_size,
        chunk_size: trailer.len(),
    });
    Ok(slot.status())
}

async fn produce(
    state: Arc<DeviceState>,
    features: FeatureContainer,
    queue: Arc<FrameQueue<Frame>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut acquiring = state.acquisition();
    loop {
        match pace(&state, &mut acquiring, &mut stop).await {
            Wake::Stop => break,
            Wake::Recheck => continue,
            Wake::Go => {}
        }
        if !state.is_acquiring() {
            continue;
        }

        let mut slot = tokio::select! {
            _ = stop.changed() => break,
            slot = queue.next_for_capture() => match slot {
                Ok(slot) => slot,
                Err(err) => {
                    warn!(camera = %state.id(), error = %err, "Capture queue failed");
                    break;
                }
            },
        };
        if !state.is_acquiring() {
            // Stopped while waiting for a buffer; the slot goes back unfilled.
            drop(slot);
            continue;
        }

        let frame_id = state.next_frame_id();
        let status = match fill(&state, &mut slot, frame_id) {
            Ok(status) => status,
            Err(err) => {
                warn!(camera = %state.id(), frame_id, error = %err, "Failed to fill frame");
                continue;
            }
        };
        slot.complete();
        trace!(camera = %state.id(), frame_id, %status, "Frame completed");

        bump(&features, "StreamDeliveredFrameCount");
        if status != FrameStatus::Completed {
            bump(&features, "StreamIncompleteFrameCount");
        }
        if state.frame_limit().is_some_and(|limit| frame_id >= limit) {
            debug!(camera = %state.id(), frame_id, "Frame count reached");
            state.end_acquisition();
        }
    }
    debug!(camera = %state.id(), "Producer exited");
}

#[async_trait]
impl StreamDevice for SimStream {
    fn index(&self) -> usize {
        self.index
    }

    fn features(&self) -> FeatureContainer {
        self.features.clone()
    }

    fn allocate_buffers(&self, count: usize, size: usize) -> Result<Vec<PayloadBuffer>> {
        self.state.errors.check(self.state.id(), "allocate_buffers")?;
        let pool = PayloadPool::new(count, size).ok_or_else(|| {
            VmbError::AllocationError(format!("cannot allocate {} buffers of {} bytes", count, size))
        })?;
        let buffers = pool.lend(count).ok_or_else(|| {
            VmbError::AllocationError(format!("payload pool could not lend {} buffers", count))
        })?;
        Ok(buffers)
    }

    async fn start_streaming(&self, queue: Arc<FrameQueue<Frame>>) -> Result<()> {
        self.state.errors.check(self.state.id(), "start_streaming")?;
        let mut producer = self.producer.lock();
        if producer.is_some() {
            return Err(VmbError::InvalidState("stream is already streaming".into()));
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(produce(
            Arc::clone(&self.state),
            self.features.clone(),
            queue,
            stop_rx,
        ));
        *producer = Some(Producer { stop, task });
        info!(camera = %self.state.id(), stream = self.index, "Streaming started");
        Ok(())
    }

    async fn stop_streaming(&self) -> Result<()> {
        let producer = self.producer.lock().take();
        let Some(producer) = producer else {
            return Ok(());
        };
        producer.stop.send_replace(true);
        if let Err(err) = producer.task.await {
            warn!(camera = %self.state.id(), error = %err, "Producer task failed");
        }
        info!(camera = %self.state.id(), stream = self.index, "Streaming stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_streaming().await?;
        self.open.store(false, Ordering::SeqCst);
        debug!(camera = %self.state.id(), stream = self.index, "Stream closed");
        Ok(())
    }
}

impl Drop for SimStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.lock().take() {
            producer.task.abort();
        }
        self.open.store(false, Ordering::SeqCst);
    }
}
