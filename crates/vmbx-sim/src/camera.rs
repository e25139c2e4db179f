//! Simulated camera: device state, command handlers and events.

use crate::errors::ErrorConfig;
use crate::features::{self, max_trailer_size};
use crate::rng::SimRng;
use crate::stream::SimStream;
use crate::SimCameraConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};
use vmbx_core::chunk::ChunkLayout;
use vmbx_core::event::{feature_for, EventOccurrence, EVENT_NOTIFICATION, EVENT_SELECTOR};
use vmbx_core::feature::{
    Access, ChangeSubscription, Constraint, Feature, FeatureContainer, FeatureValue,
    WeakFeatureContainer,
};
use vmbx_core::frame::PixelFormat;
use vmbx_core::module::ModuleDescriptor;
use vmbx_core::platform::{CameraDevice, StreamDevice};
use vmbx_core::{Result, VmbError};

/// Features that cannot change while the camera acquires.
const LOCKED_WHILE_ACQUIRING: [&str; 4] = ["Width", "Height", "PixelFormat", "ChunkModeActive"];

/// Features that change `PayloadSize` or the ROI limits.
const GEOMETRY_FEATURES: [&str; 6] = [
    "Width",
    "Height",
    "OffsetX",
    "OffsetY",
    "PixelFormat",
    "ChunkModeActive",
];

/// Image geometry as configured on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Geometry {
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub pixel_format: PixelFormat,
}

/// State shared by a camera, its stream and its command handlers.
pub(crate) struct DeviceState {
    pub(crate) config: SimCameraConfig,
    pub(crate) features: FeatureContainer,
    pub(crate) layout: ChunkLayout,
    pub(crate) errors: ErrorConfig,
    pub(crate) rng: SimRng,
    pub(crate) trigger: Notify,
    acquiring: watch::Sender<bool>,
    frame_counter: AtomicU64,
    event_sequence: Mutex<HashMap<String, u64>>,
    events: mpsc::UnboundedSender<EventOccurrence>,
    epoch: Instant,
    listeners: Mutex<Vec<ChangeSubscription>>,
}

impl DeviceState {
    pub(crate) fn id(&self) -> &str {
        &self.config.id
    }

    pub(crate) fn acquisition(&self) -> watch::Receiver<bool> {
        self.acquiring.subscribe()
    }

    pub(crate) fn is_acquiring(&self) -> bool {
        *self.acquiring.borrow()
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Advance the device frame counter. The first frame after `AcquisitionStart` is 1.
    pub(crate) fn next_frame_id(&self) -> u64 {
        self.frame_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Frames the device stops after, per `AcquisitionMode`.
    pub(crate) fn frame_limit(&self) -> Option<u64> {
        match self.features.read_enum("AcquisitionMode").ok()?.as_str() {
            "SingleFrame" => Some(1),
            "MultiFrame" => self
                .features
                .read_int("AcquisitionFrameCount")
                .ok()
                .map(|n| n.max(1) as u64),
            _ => None,
        }
    }

    pub(crate) fn frames_in_run(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    /// Frames wait for `TriggerSoftware`.
    pub(crate) fn trigger_mode(&self) -> bool {
        self.features
            .read_selected("TriggerMode", "FrameStart")
            .ok()
            .and_then(|v| v.as_str().map(|s| s == "On"))
            .unwrap_or(false)
    }

    /// Time between frames in free-running mode.
    pub(crate) fn frame_period(&self) -> Duration {
        let fixed_rate = self
            .features
            .read_bool("AcquisitionFrameRateEnable")
            .unwrap_or(false);
        if fixed_rate {
            if let Ok(rate) = self.features.read_float("AcquisitionFrameRate") {
                if rate > 0.0 {
                    return Duration::from_secs_f64(1.0 / rate);
                }
            }
        }
        let exposure_us = self.features.read_float("ExposureTime").unwrap_or(5_000.0);
        Duration::from_secs_f64((exposure_us / 1e6).max(0.001))
    }

    pub(crate) fn geometry(&self) -> Result<Geometry> {
        let f = &self.features;
        Ok(Geometry {
            width: f.read_int("Width")? as u32,
            height: f.read_int("Height")? as u32,
            offset_x: f.read_int("OffsetX")? as u32,
            offset_y: f.read_int("OffsetY")? as u32,
            pixel_format: PixelFormat::from_entry(&f.read_enum("PixelFormat")?)?,
        })
    }

    /// Chunk values enabled through `ChunkSelector`/`ChunkEnable`, or
    /// nothing while `ChunkModeActive` is off.
    pub(crate) fn chunk_values(
        &self,
        geometry: &Geometry,
        frame_id: u64,
        timestamp: u64,
    ) -> Vec<(u32, FeatureValue)> {
        let f = &self.features;
        if !f.read_bool("ChunkModeActive").unwrap_or(false) {
            return Vec::new();
        }
        self.layout
            .descriptors()
            .iter()
            .filter(|d| {
                f.read_selected("ChunkEnable", &d.selector_entry)
                    .ok()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            })
            .filter_map(|d| {
                let value = match d.selector_entry.as_str() {
                    "Timestamp" => FeatureValue::Integer(timestamp as i64),
                    "Width" => FeatureValue::Integer(i64::from(geometry.width)),
                    "Height" => FeatureValue::Integer(i64::from(geometry.height)),
                    "OffsetX" => FeatureValue::Integer(i64::from(geometry.offset_x)),
                    "OffsetY" => FeatureValue::Integer(i64::from(geometry.offset_y)),
                    "FrameID" => FeatureValue::Integer(frame_id as i64),
                    "ExposureTime" => FeatureValue::Float(f.read_float("ExposureTime").ok()?),
                    "Gain" => FeatureValue::Float(f.read_float("Gain").ok()?),
                    _ => return None,
                };
                Some((d.id, value))
            })
            .collect()
    }

    fn start_acquisition(&self) -> Result<()> {
        self.errors.check(self.id(), "AcquisitionStart")?;
        if self.is_acquiring() {
            debug!(camera = %self.id(), "AcquisitionStart while acquiring ignored");
            return Ok(());
        }
        self.frame_counter.store(0, Ordering::SeqCst);
        for name in LOCKED_WHILE_ACQUIRING {
            self.features.set_access(name, Access::ReadOnly)?;
        }
        self.acquiring.send_replace(true);
        info!(camera = %self.id(), "Acquisition started");
        self.emit("AcquisitionStart");
        Ok(())
    }

    /// Stop producing frames. Also used when a SingleFrame/MultiFrame run ends.
    pub(crate) fn end_acquisition(&self) {
        if !self.acquiring.send_replace(false) {
            return;
        }
        for name in LOCKED_WHILE_ACQUIRING {
            if let Err(err) = self.features.set_access(name, Access::ReadWrite) {
                warn!(camera = %self.id(), feature = name, error = %err, "Failed to unlock feature");
            }
        }
        info!(camera = %self.id(), frames = self.frames_in_run(), "Acquisition stopped");
        self.emit("AcquisitionEnd");
    }

    fn software_trigger(&self) -> Result<()> {
        if !self.is_acquiring() || !self.trigger_mode() {
            debug!(camera = %self.id(), "TriggerSoftware ignored");
            return Ok(());
        }
        self.trigger.notify_one();
        Ok(())
    }

    fn emit(&self, category: &str) {
        let enabled = self
            .features
            .read_selected(EVENT_NOTIFICATION, category)
            .ok()
            .and_then(|v| v.as_str().map(|s| s == "On"))
            .unwrap_or(false);
        if !enabled {
            return;
        }

        let sequence = {
            let mut seqs = self.event_sequence.lock();
            let seq = seqs.entry(category.to_string()).or_insert(0);
            *seq += 1;
            *seq
        };
        let timestamp = self.now_ns();
        let event_id = 0x9000 + self.features.entry_code(EVENT_SELECTOR, category).unwrap_or(0) as u64;

        let feature = feature_for(category);
        let updates = [
            (feature.clone(), event_id as i64),
            (format!("{}Timestamp", feature), timestamp as i64),
        ];
        for (name, value) in updates {
            if let Err(err) = self.features.set_device_value(&name, value) {
                warn!(camera = %self.id(), feature = %name, error = %err, "Failed to update event data");
            }
        }

        let occurrence = EventOccurrence::new(category, event_id, timestamp, sequence);
        if self.events.send(occurrence).is_err() {
            debug!(camera = %self.id(), category, "Event receiver gone");
        }
    }
}

/// Recompute ROI limits and `PayloadSize` after a geometry change.
fn update_derived(f: &FeatureContainer, cfg: &SimCameraConfig, trailer: usize) -> Result<()> {
    let (sw, sh) = (i64::from(cfg.sensor_width), i64::from(cfg.sensor_height));
    let width = f.read_int("Width")?;
    let height = f.read_int("Height")?;
    let offset_x = f.read_int("OffsetX")?;
    let offset_y = f.read_int("OffsetY")?;
    let format = PixelFormat::from_entry(&f.read_enum("PixelFormat")?)?;

    let range = |min: i64, max: i64, step: i64| Constraint::Integer {
        min,
        max: max.max(min),
        increment: Some(step),
    };
    f.set_constraint("OffsetX", range(0, sw - width, 8))?;
    f.set_constraint("OffsetY", range(0, sh - height, 2))?;
    f.set_constraint("Width", range(8, sw - offset_x, 8))?;
    f.set_constraint("Height", range(8, sh - offset_y, 2))?;

    let chunks = if f.read_bool("ChunkModeActive")? { trailer } else { 0 };
    let payload = width * height * format.bytes_per_pixel() as i64 + chunks as i64;
    f.set_device_value("PayloadSize", payload)
}

fn with_state<F>(state: &Weak<DeviceState>, f: F) -> Result<()>
where
    F: FnOnce(&DeviceState) -> Result<()>,
{
    match state.upgrade() {
        Some(state) => f(&state),
        None => Err(VmbError::InvalidState("camera is closed".into())),
    }
}

/// A simulated camera opened through [`SimTransport`](crate::SimTransport).
pub struct SimCamera {
    descriptor: ModuleDescriptor,
    state: Arc<DeviceState>,
    local: FeatureContainer,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventOccurrence>>>,
    stream_open: Arc<AtomicBool>,
    open_cameras: Arc<Mutex<HashSet<String>>>,
    closed: AtomicBool,
}

impl SimCamera {
    pub(crate) fn new(
        descriptor: ModuleDescriptor,
        config: SimCameraConfig,
        errors: ErrorConfig,
        open_cameras: Arc<Mutex<HashSet<String>>>,
    ) -> Result<Self> {
        let layout = ChunkLayout::standard();
        let remote = features::camera(&config, &layout);
        let local = features::local_device(&config);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (acquiring, _) = watch::channel(false);

        let state = Arc::new(DeviceState {
            rng: SimRng::new(config.seed),
            config,
            features: remote.clone(),
            layout,
            errors,
            trigger: Notify::new(),
            acquiring,
            frame_counter: AtomicU64::new(0),
            event_sequence: Mutex::new(HashMap::new()),
            events: events_tx,
            epoch: Instant::now(),
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&state);
        remote.insert(
            Feature::command("AcquisitionStart").with_hook(move |_| with_state(&weak, DeviceState::start_acquisition)),
        );
        let weak = Arc::downgrade(&state);
        remote.insert(Feature::command("AcquisitionStop").with_hook(move |_| {
            with_state(&weak, |s| {
                s.end_acquisition();
                Ok(())
            })
        }));
        let weak = Arc::downgrade(&state);
        remote.insert(
            Feature::command("TriggerSoftware").with_hook(move |_| with_state(&weak, DeviceState::software_trigger)),
        );

        let trailer = max_trailer_size(&state.layout);
        update_derived(&remote, &state.config, trailer)?;
        let mut listeners = Vec::new();
        for name in GEOMETRY_FEATURES {
            let weak: WeakFeatureContainer = remote.downgrade();
            let cfg = state.config.clone();
            listeners.push(remote.on_change(name, move |feature, _| {
                let Some(f) = weak.upgrade() else {
                    return;
                };
                if let Err(err) = update_derived(&f, &cfg, trailer) {
                    warn!(camera = %cfg.id, feature, error = %err, "Failed to update derived features");
                }
            })?);
        }
        *state.listeners.lock() = listeners;

        Ok(Self {
            descriptor,
            state,
            local,
            events: Mutex::new(Some(events_rx)),
            stream_open: Arc::new(AtomicBool::new(false)),
            open_cameras,
            closed: AtomicBool::new(false),
        })
    }

    fn release(&self) {
        self.state.end_acquisition();
        self.open_cameras.lock().remove(&self.descriptor.id);
    }
}

#[async_trait]
impl CameraDevice for SimCamera {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    fn remote_features(&self) -> FeatureContainer {
        self.state.features.clone()
    }

    fn local_features(&self) -> FeatureContainer {
        self.local.clone()
    }

    fn stream_count(&self) -> usize {
        1
    }

    async fn open_stream(&self, index: usize) -> Result<Arc<dyn StreamDevice>> {
        self.state.errors.check(self.state.id(), "open_stream")?;
        if index >= self.stream_count() {
            return Err(VmbError::InvalidIndex(index));
        }
        if self.stream_open.swap(true, Ordering::SeqCst) {
            return Err(VmbError::AlreadyOpen(format!(
                "stream {} of {}",
                index, self.descriptor.id
            )));
        }
        debug!(camera = %self.descriptor.id, index, "Stream opened");
        Ok(Arc::new(SimStream::new(
            Arc::clone(&self.state),
            index,
            Arc::clone(&self.stream_open),
        )))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EventOccurrence>> {
        self.events.lock().take()
    }

    fn chunk_layout(&self) -> ChunkLayout {
        self.state.layout.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.state.errors.check(self.state.id(), "close_camera");
        self.release();
        debug!(camera = %self.descriptor.id, "Camera closed");
        result
    }
}

impl Drop for SimCamera {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimTransport;
    use vmbx_core::module::InterfaceKind;
    use vmbx_core::platform::Transport;

    async fn open() -> Arc<dyn CameraDevice> {
        let transport = SimTransport::new(vec![SimCameraConfig::small("DEV_A", InterfaceKind::Usb)]);
        transport.open_camera("DEV_A").await.unwrap()
    }

    #[tokio::test]
    async fn test_payload_size_follows_geometry() {
        let camera = open().await;
        let f = camera.remote_features();
        assert_eq!(f.read_int("PayloadSize").unwrap(), 64 * 48);

        f.write("Width", 32i64).unwrap();
        f.write_entry("PixelFormat", "Mono12").unwrap();
        assert_eq!(f.read_int("PayloadSize").unwrap(), 32 * 48 * 2);

        f.write("ChunkModeActive", true).unwrap();
        assert_eq!(
            f.read_int("PayloadSize").unwrap(),
            32 * 48 * 2 + max_trailer_size(&camera.chunk_layout()) as i64
        );
    }

    #[tokio::test]
    async fn test_roi_limits_follow_extent() {
        let camera = open().await;
        let f = camera.remote_features();
        assert!(matches!(
            f.write("OffsetX", 8i64),
            Err(VmbError::OutOfRange { .. })
        ));
        f.write("Width", 32i64).unwrap();
        f.write("OffsetX", 32i64).unwrap();
        assert!(matches!(
            f.write("Width", 64i64),
            Err(VmbError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_acquisition_locks_geometry() {
        let camera = open().await;
        let f = camera.remote_features();
        f.run_command("AcquisitionStart").unwrap();
        assert!(matches!(
            f.write("Width", 32i64),
            Err(VmbError::InvalidAccess(_))
        ));
        f.run_command("AcquisitionStop").unwrap();
        f.write("Width", 32i64).unwrap();
    }

    #[tokio::test]
    async fn test_events_only_when_enabled() {
        let camera = open().await;
        let f = camera.remote_features();
        let mut events = camera.take_events().unwrap();
        assert!(camera.take_events().is_none());

        f.run_command("AcquisitionStart").unwrap();
        f.run_command("AcquisitionStop").unwrap();
        assert!(events.try_recv().is_err());

        f.write_entry(EVENT_SELECTOR, "AcquisitionStart").unwrap();
        f.write_entry(EVENT_NOTIFICATION, "On").unwrap();
        f.run_command("AcquisitionStart").unwrap();
        let event = events.try_recv().unwrap();
        assert_eq!(event.category, "AcquisitionStart");
        assert_eq!(event.sequence, 1);
        assert_eq!(
            f.read_int("EventAcquisitionStart").unwrap(),
            event.event_id as i64
        );
        f.run_command("AcquisitionStop").unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_stream_index() {
        let camera = open().await;
        assert!(matches!(
            camera.open_stream(1).await,
            Err(VmbError::InvalidIndex(1))
        ));
        let stream = camera.open_stream(0).await.unwrap();
        assert!(matches!(
            camera.open_stream(0).await,
            Err(VmbError::AlreadyOpen(_))
        ));
        stream.close().await.unwrap();
        assert!(camera.open_stream(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_software_trigger_ignored_when_idle() {
        let camera = open().await;
        let f = camera.remote_features();
        f.write_entry("TriggerSelector", "FrameStart").unwrap();
        f.write_entry("TriggerMode", "On").unwrap();
        assert!(f.run_command("TriggerSoftware").is_ok());
        assert!(f.is_command_done("TriggerSoftware").unwrap());
    }

    #[tokio::test]
    async fn test_close_releases_id() {
        let transport = SimTransport::new(vec![SimCameraConfig::small("DEV_A", InterfaceKind::Usb)]);
        let camera = transport.open_camera("DEV_A").await.unwrap();
        assert!(matches!(
            transport.open_camera("DEV_A").await,
            Err(VmbError::AlreadyOpen(_))
        ));
        camera.close().await.unwrap();
        assert!(transport.open_camera("DEV_A").await.is_ok());
    }
}
