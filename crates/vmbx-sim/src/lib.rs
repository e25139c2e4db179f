//! Simulated platform for vmbx.
//!
//! Implements the [`Transport`](vmbx_core::platform::Transport),
//! [`CameraDevice`](vmbx_core::platform::CameraDevice) and
//! [`StreamDevice`](vmbx_core::platform::StreamDevice) traits without
//! hardware:
//!
//! - one transport layer, one interface per link type in use, and the
//!   configured cameras
//! - standard feature trees for every module
//! - streams that fill queued buffers with a test pattern, append chunk data
//!   while `ChunkModeActive` is set, and mark frames `Incomplete` at a
//!   configurable rate
//! - `AcquisitionStart` / `AcquisitionEnd` events
//! - error injection per camera ([`ErrorConfig`])
//!
//! # Example
//!
//! ```rust,no_run
//! use vmbx_sim::{SimCameraConfig, SimTransport};
//! use vmbx_core::platform::Transport;
//! use vmbx_core::module::ModuleKind;
//!
//! let transport = SimTransport::new(vec![SimCameraConfig::default()]);
//! let cameras = transport.list_modules(ModuleKind::Camera).unwrap();
//! assert_eq!(cameras.len(), 1);
//! ```

pub mod camera;
pub mod errors;
pub mod features;
pub mod pattern;
pub mod rng;
pub mod stream;
pub mod transport;

pub use camera::SimCamera;
pub use errors::{ErrorConfig, ErrorScenario};
pub use stream::SimStream;
pub use transport::SimTransport;

use serde::{Deserialize, Serialize};
use vmbx_core::module::InterfaceKind;

/// Definition of one simulated camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimCameraConfig {
    /// Camera id.
    pub id: String,
    /// Model name.
    pub model: String,
    /// Serial number.
    pub serial: String,
    /// Link type.
    pub interface: InterfaceKind,
    /// Sensor width in pixels (multiple of 8).
    pub sensor_width: u32,
    /// Sensor height in pixels (multiple of 2).
    pub sensor_height: u32,
    /// Probability that a frame completes as `Incomplete`.
    pub incomplete_rate: f64,
    /// RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            id: "DEV_SIM0001".to_string(),
            model: "Sim 1800 U-040m".to_string(),
            serial: "SIM0001".to_string(),
            interface: InterfaceKind::Usb,
            sensor_width: 640,
            sensor_height: 480,
            incomplete_rate: 0.0,
            seed: None,
        }
    }
}

impl SimCameraConfig {
    /// Camera with the given id and small sensor, handy in tests.
    #[must_use]
    pub fn small(id: &str, interface: InterfaceKind) -> Self {
        Self {
            id: id.to_string(),
            serial: format!("SN-{}", id),
            interface,
            sensor_width: 64,
            sensor_height: 48,
            seed: Some(1),
            ..Self::default()
        }
    }
}
