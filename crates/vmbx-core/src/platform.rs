//! Contract consumed from the platform (transport) layer.
//!
//! Enumeration, physical transport and device I/O live below these traits.
//! The application-facing crate only talks to hardware through them, and
//! `vmbx-sim` provides the simulated implementation used by tests and the CLI.
//!
//! # Lifecycle
//!
//! - [`Transport::open_camera`] hands out at most one [`CameraDevice`] per
//!   camera id at a time (`AlreadyOpen` otherwise).
//! - [`CameraDevice::open_stream`] hands out the stream at an index
//!   (`InvalidIndex` past [`CameraDevice::stream_count`]).
//! - Streams fill buffers of a [`FrameQueue`] between
//!   [`StreamDevice::start_streaming`] and [`StreamDevice::stop_streaming`],
//!   stalling whenever no buffer is queued.
//! - Acquisition itself is switched by the camera's `AcquisitionStart` and
//!   `AcquisitionStop` command features.

use crate::chunk::ChunkLayout;
use crate::error::Result;
use crate::event::EventOccurrence;
use crate::feature::FeatureContainer;
use crate::frame::Frame;
use crate::module::{ModuleDescriptor, ModuleKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use vmbx_pool::{FrameQueue, PayloadBuffer};

/// Entry point of a platform: enumeration and camera access.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Modules of one kind, in enumeration order.
    ///
    /// Only `TransportLayer`, `Interface` and `Camera` are enumerable.
    fn list_modules(&self, kind: ModuleKind) -> Result<Vec<ModuleDescriptor>>;

    /// Feature container of an enumerated transport layer or interface.
    fn module_features(&self, kind: ModuleKind, id: &str) -> Result<FeatureContainer>;

    /// Open a camera by id.
    ///
    /// Fails with `NotFound` for unknown ids and `AlreadyOpen` while another
    /// handle to the camera is live.
    async fn open_camera(&self, id: &str) -> Result<Arc<dyn CameraDevice>>;
}

/// An opened camera.
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Identity of the camera.
    fn descriptor(&self) -> &ModuleDescriptor;

    /// Features of the remote device (`Width`, `ExposureTime`, ...).
    fn remote_features(&self) -> FeatureContainer;

    /// Features of the host-side local device.
    fn local_features(&self) -> FeatureContainer;

    /// Number of streams the camera exposes.
    fn stream_count(&self) -> usize;

    /// Open the stream at `index`.
    async fn open_stream(&self, index: usize) -> Result<Arc<dyn StreamDevice>>;

    /// Receiver of device events. Yields `Some` once; later calls get `None`.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EventOccurrence>>;

    /// Chunk ids this camera writes.
    fn chunk_layout(&self) -> ChunkLayout;

    /// Release the camera. Called once; the device id can be opened again afterwards.
    async fn close(&self) -> Result<()>;
}

/// One data stream of an opened camera.
#[async_trait]
pub trait StreamDevice: Send + Sync {
    /// Stream index on the camera.
    fn index(&self) -> usize;

    /// Stream module features.
    fn features(&self) -> FeatureContainer;

    /// Transport-owned buffers for a `TransportAllocates` session.
    ///
    /// Replaces any buffers handed out earlier; those return to the old pool
    /// when dropped.
    fn allocate_buffers(&self, count: usize, size: usize) -> Result<Vec<PayloadBuffer>>;

    /// Start filling queued buffers of `queue`.
    async fn start_streaming(&self, queue: Arc<FrameQueue<Frame>>) -> Result<()>;

    /// Stop filling buffers. Returns once the producer has let go of every
    /// buffer it was filling.
    async fn stop_streaming(&self) -> Result<()>;

    /// Release the stream.
    async fn close(&self) -> Result<()>;
}
