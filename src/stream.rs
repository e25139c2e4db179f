//! Open stream handles.

use crate::acquisition::{Capture, CaptureOptions};
use crate::config::CaptureConfig;
use crate::lifecycle::{Registry, Scope, Teardown};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use vmbx_core::chunk::ChunkLayout;
use vmbx_core::feature::FeatureContainer;
use vmbx_core::platform::StreamDevice;
use vmbx_core::Result;
use vmbx_pool::AllocationMode;

const ADJUST_PACKET_SIZE: &str = "GVSPAdjustPacketSize";
const ADJUST_TIMEOUT: Duration = Duration::from_secs(1);
const ADJUST_POLL: Duration = Duration::from_millis(10);

pub(crate) struct StreamInner {
    label: String,
    device: Arc<dyn StreamDevice>,
    camera_features: FeatureContainer,
    chunk_layout: ChunkLayout,
    camera: Scope,
    scope: Scope,
    captures: Registry,
    capture_config: CaptureConfig,
}

impl StreamInner {
    pub(crate) fn new(
        camera_id: &str,
        device: Arc<dyn StreamDevice>,
        camera_features: FeatureContainer,
        chunk_layout: ChunkLayout,
        camera: Scope,
        capture_config: CaptureConfig,
    ) -> Self {
        let label = format!("camera {} stream {}", camera_id, device.index());
        Self {
            scope: Scope::new(label.clone()),
            captures: Registry::new(label.clone()),
            label,
            device,
            camera_features,
            chunk_layout,
            camera,
            capture_config,
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn device(&self) -> &Arc<dyn StreamDevice> {
        &self.device
    }

    pub(crate) fn camera_features(&self) -> &FeatureContainer {
        &self.camera_features
    }

    pub(crate) fn chunk_layout(&self) -> ChunkLayout {
        self.chunk_layout.clone()
    }

    pub(crate) fn captures(&self) -> &Registry {
        &self.captures
    }

    /// `InvalidState` once this stream or its camera closed.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.camera.ensure_open()?;
        self.scope.ensure_open()
    }

    /// Run the GigE packet-size negotiation. Failures are logged only.
    pub(crate) async fn adjust_packet_size(&self) {
        let features = self.device.features();
        if !features.contains(ADJUST_PACKET_SIZE) {
            debug!(stream = %self.label, "No packet size negotiation on this stream");
            return;
        }
        if let Err(err) = features.run_command(ADJUST_PACKET_SIZE) {
            warn!(stream = %self.label, error = %err, "Packet size adjustment failed");
            return;
        }
        let polled = tokio::time::timeout(ADJUST_TIMEOUT, async {
            loop {
                match features.is_command_done(ADJUST_PACKET_SIZE) {
                    Ok(true) => return Ok(()),
                    Ok(false) => tokio::time::sleep(ADJUST_POLL).await,
                    Err(err) => return Err(err),
                }
            }
        })
        .await;
        match polled {
            Ok(Ok(())) => info!(
                stream = %self.label,
                packet_size = features.read_int("GVSPPacketSize").unwrap_or_default(),
                "Packet size adjusted"
            ),
            Ok(Err(err)) => warn!(stream = %self.label, error = %err, "Packet size adjustment failed"),
            Err(_) => warn!(stream = %self.label, "Packet size adjustment did not finish in time"),
        }
    }
}

#[async_trait]
impl Teardown for StreamInner {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn teardown(&self) -> Result<()> {
        if !self.scope.close() {
            return Ok(());
        }
        let failures = self.captures.teardown_all().await;
        if failures > 0 {
            warn!(stream = %self.label, failures, "Some captures did not end cleanly");
        }
        if let Err(err) = self.device.stop_streaming().await {
            warn!(stream = %self.label, error = %err, "Failed to stop streaming");
        }
        self.device.close().await?;
        info!(stream = %self.label, "Stream closed");
        Ok(())
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if !self.scope.close() {
            return;
        }
        let device = Arc::clone(&self.device);
        let label = std::mem::take(&mut self.label);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = device.close().await {
                    warn!(stream = %label, error = %err, "Stream close failed");
                }
            });
        }
    }
}

/// An open stream of a camera.
///
/// The stream stays open while this handle or any capture prepared on it is
/// alive, and is closed with its camera at the latest.
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub(crate) fn new(inner: Arc<StreamInner>) -> Self {
        Self { inner }
    }

    /// Stream index on the camera.
    #[must_use]
    pub fn index(&self) -> usize {
        self.inner.device.index()
    }

    /// Stream module features.
    #[must_use]
    pub fn features(&self) -> FeatureContainer {
        self.inner.device.features()
    }

    /// Whether the stream and its camera are still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.ensure_open().is_ok()
    }

    /// Prepare a capture session with the configured delivery options.
    pub async fn prepare_capture(&self, mode: AllocationMode, buffer_count: usize) -> Result<Capture> {
        let options = CaptureOptions::from(&self.inner.capture_config);
        self.prepare_capture_with(mode, buffer_count, options).await
    }

    /// Prepare a capture session with explicit delivery options.
    pub async fn prepare_capture_with(
        &self,
        mode: AllocationMode,
        buffer_count: usize,
        options: CaptureOptions,
    ) -> Result<Capture> {
        self.inner.ensure_open()?;
        let capture = Capture::new(Arc::clone(&self.inner), options, false);
        capture.prepare(mode, buffer_count).await?;
        Ok(capture)
    }

    /// Prepare a capture that closes this stream when it ends.
    pub(crate) async fn prepare_owning_capture(
        &self,
        mode: AllocationMode,
        buffer_count: usize,
    ) -> Result<Capture> {
        self.inner.ensure_open()?;
        let options = CaptureOptions::from(&self.inner.capture_config);
        let capture = Capture::new(Arc::clone(&self.inner), options, true);
        capture.prepare(mode, buffer_count).await?;
        Ok(capture)
    }

    /// End every capture on this stream and close it.
    pub async fn close(&self) -> Result<()> {
        self.inner.teardown().await
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("label", &self.inner.label)
            .field("open", &self.is_open())
            .finish()
    }
}
