//! # vmbx
//!
//! Asynchronous frame acquisition, typed feature access and device event
//! delivery for GenICam-style cameras.
//!
//! ## Crate Structure
//!
//! - **`system`**: [`System`], the entry point. Enumerates transport layers,
//!   interfaces and cameras, and opens cameras.
//! - **`camera`**: [`Camera`], an open camera with its feature tree, event
//!   channel and streams.
//! - **`stream`**: [`Stream`], one data stream of a camera.
//! - **`acquisition`**: [`Capture`], the acquisition engine. Announces
//!   buffers, starts and stops streaming, and hands completed frames to a
//!   callback or to [`Capture::wait_for_frame`].
//! - **`lifecycle`**: parent-tracks-children teardown shared by the handles.
//! - **`recorder`**: writes completed frames as raw files.
//! - **`setup`**: feature sequences for timing modes, ROI and chunk selection.
//! - **`config`**: Figment-based configuration.
//! - **`logging`**: `tracing` subscriber setup.
//!
//! The feature model, frame and chunk types, event channel and error type
//! live in `vmbx-core`; the buffer queue in `vmbx-pool`; the simulated
//! platform in `vmbx-sim`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use vmbx::{AllocationMode, System, VmbxConfig};
//!
//! # async fn run() -> vmbx::Result<()> {
//! let system = System::from_config(VmbxConfig::default())?;
//! let cameras = system.get_cameras()?;
//! let camera = system.open(&cameras[0]).await?;
//!
//! let capture = camera.prepare_capture(AllocationMode::ApplicationAllocates, 5).await?;
//! capture.register_frame_callback(|frame| {
//!     println!("frame {} {}", frame.id(), frame.status());
//!     Ok(())
//! })?;
//! capture.start().await?;
//! tokio::time::sleep(Duration::from_secs(1)).await;
//! capture.stop().await?;
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod recorder;
pub mod setup;
pub mod stream;
pub mod system;

pub use acquisition::{Capture, CaptureOptions, DeliveredFrame, EngineState, FrameStatistics};
pub use camera::Camera;
pub use config::VmbxConfig;
pub use stream::Stream;
pub use system::System;

pub use vmbx_core::{DeviceFault, DeviceFaultKind, Result, VmbError};
pub use vmbx_pool::AllocationMode;

/// Common imports.
pub mod prelude {
    pub use crate::acquisition::{Capture, DeliveredFrame, EngineState};
    pub use crate::camera::Camera;
    pub use crate::config::VmbxConfig;
    pub use crate::stream::Stream;
    pub use crate::system::System;
    pub use vmbx_core::prelude::*;
    pub use vmbx_pool::AllocationMode;
}
