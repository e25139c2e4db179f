//! Open camera handles.
//!
//! A [`Camera`] owns its device connection, the event channel of the remote
//! device and a registry of the streams opened beneath it. Closing the camera
//! (explicitly, or by dropping the handle) stops every running acquisition,
//! closes the streams and then the device.

use crate::acquisition::Capture;
use crate::config::CaptureConfig;
use crate::lifecycle::{Registry, Scope, Teardown};
use crate::stream::{Stream, StreamInner};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vmbx_core::event::{EventChannel, EventOccurrence, Subscription};
use vmbx_core::feature::FeatureContainer;
use vmbx_core::module::{InterfaceKind, ModuleDescriptor};
use vmbx_core::platform::CameraDevice;
use vmbx_core::Result;
use vmbx_pool::AllocationMode;

pub(crate) struct CameraInner {
    descriptor: ModuleDescriptor,
    device: Arc<dyn CameraDevice>,
    system: Scope,
    scope: Scope,
    streams: Registry,
    events: EventChannel,
    capture_config: CaptureConfig,
}

impl CameraInner {
    fn ensure_open(&self) -> Result<()> {
        self.system.ensure_open()?;
        self.scope.ensure_open()
    }

    async fn open_stream(&self, index: usize) -> Result<Arc<StreamInner>> {
        self.ensure_open()?;
        let device = self.device.open_stream(index).await?;
        let inner = Arc::new(StreamInner::new(
            &self.descriptor.id,
            device,
            self.device.remote_features(),
            self.device.chunk_layout(),
            self.scope.clone(),
            self.capture_config.clone(),
        ));
        self.streams.register(&inner);

        if self.descriptor.interface_kind == Some(InterfaceKind::GigE)
            && self.capture_config.adjust_packet_size
        {
            inner.adjust_packet_size().await;
        }
        info!(camera_id = %self.descriptor.id, stream = index, "Stream opened");
        Ok(inner)
    }
}

#[async_trait]
impl Teardown for CameraInner {
    fn label(&self) -> String {
        format!("camera {}", self.descriptor.id)
    }

    async fn teardown(&self) -> Result<()> {
        if !self.scope.close() {
            return Ok(());
        }
        let failures = self.streams.teardown_all().await;
        if failures > 0 {
            warn!(camera_id = %self.descriptor.id, failures, "Some streams did not close cleanly");
        }
        self.events.close();
        self.device.close().await?;
        info!(camera_id = %self.descriptor.id, "Camera closed");
        Ok(())
    }
}

/// An open camera.
pub struct Camera {
    inner: Arc<CameraInner>,
}

impl Camera {
    pub(crate) fn new(
        device: Arc<dyn CameraDevice>,
        system: Scope,
        capture_config: CaptureConfig,
    ) -> Result<Self> {
        let descriptor = device.descriptor().clone();
        let events = match device.take_events() {
            Some(rx) => rx,
            None => mpsc::unbounded_channel::<EventOccurrence>().1,
        };
        let events = EventChannel::new(device.remote_features(), events)?;
        let label = format!("camera {}", descriptor.id);
        Ok(Self {
            inner: Arc::new(CameraInner {
                scope: Scope::new(label.clone()),
                streams: Registry::new(label),
                descriptor,
                device,
                system,
                events,
                capture_config,
            }),
        })
    }

    pub(crate) fn inner(&self) -> &Arc<CameraInner> {
        &self.inner
    }

    /// Descriptor the camera was opened from.
    #[must_use]
    pub fn descriptor(&self) -> &ModuleDescriptor {
        &self.inner.descriptor
    }

    /// Camera id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.descriptor.id
    }

    /// Whether the camera and the system are still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.ensure_open().is_ok()
    }

    /// Remote device features.
    #[must_use]
    pub fn features(&self) -> FeatureContainer {
        self.inner.device.remote_features()
    }

    /// Local device features.
    #[must_use]
    pub fn local_features(&self) -> FeatureContainer {
        self.inner.device.local_features()
    }

    /// Number of streams the camera offers.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.device.stream_count()
    }

    /// Open stream `index`.
    pub async fn open_stream(&self, index: usize) -> Result<Stream> {
        let inner = self.inner.open_stream(index).await?;
        Ok(Stream::new(inner))
    }

    /// Open the configured stream and prepare a capture on it.
    ///
    /// The stream is closed again by [`Capture::end_capture`], or right away
    /// when preparing fails. Such a capture cannot be prepared a second time.
    pub async fn prepare_capture(&self, mode: AllocationMode, buffer_count: usize) -> Result<Capture> {
        let index = self.inner.capture_config.stream_index;
        let stream = self.open_stream(index).await?;
        match stream.prepare_owning_capture(mode, buffer_count).await {
            Ok(capture) => Ok(capture),
            Err(err) => {
                if let Err(close_err) = stream.close().await {
                    warn!(camera = %self.id(), error = %close_err, "Failed to close stream after prepare failed");
                }
                Err(err)
            }
        }
    }

    /// The camera's event channel.
    #[must_use]
    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    /// Subscribe to an event by its data feature name, e.g.
    /// `EventAcquisitionStart`.
    pub fn subscribe_event<F>(&self, feature_name: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&EventOccurrence) + Send + Sync + 'static,
    {
        self.inner.ensure_open()?;
        self.inner.events.subscribe(feature_name, callback)
    }

    /// Run a command feature of the remote device, e.g. `TriggerSoftware`.
    pub fn run_command(&self, name: &str) -> Result<()> {
        self.inner.ensure_open()?;
        self.features().run_command(name)
    }

    /// Close the camera and everything opened beneath it.
    ///
    /// Teardown failures of streams are logged; a failure of the device
    /// itself is returned after everything else was released.
    /// Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner.teardown().await
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if !self.inner.scope.is_open() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = inner.teardown().await {
                        warn!(camera_id = %inner.descriptor.id, error = %err, "Camera close failed");
                    }
                });
            }
            Err(_) => {
                inner.scope.close();
                inner.events.close();
                warn!(camera_id = %inner.descriptor.id, "Camera dropped outside a runtime");
            }
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("id", &self.id())
            .field("open", &self.is_open())
            .finish()
    }
}
