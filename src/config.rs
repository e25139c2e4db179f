//! Configuration loaded with Figment.
//!
//! Sources, later ones winning:
//! 1. `config/vmbx.toml` (or an explicit path)
//! 2. environment variables prefixed `VMBX_`, nested with `__`
//!    (`VMBX_CAPTURE__BUFFER_COUNT=8`)
//!
//! Every field has a default, so a missing file yields a working setup with
//! one simulated camera.
//!
//! # Example
//! ```no_run
//! use vmbx::config::VmbxConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = VmbxConfig::load()?;
//! config.validate()?;
//! println!("{} buffers", config.capture.buffer_count);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use vmbx_core::{Result, VmbError};
use vmbx_pool::AllocationMode;
use vmbx_sim::SimCameraConfig;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/vmbx.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmbxConfig {
    /// Application settings.
    pub application: ApplicationConfig,
    /// Capture session settings.
    pub capture: CaptureConfig,
    /// Camera setup applied before acquisition.
    pub camera: CameraConfig,
    /// Simulated platform.
    pub simulation: SimulationConfig,
}

/// Application-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name.
    pub name: String,
    /// trace, debug, info, warn or error.
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "vmbx".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Who allocates frame buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationSetting {
    /// The application allocates and announces buffers.
    Application,
    /// The transport allocates buffers.
    Transport,
}

impl From<AllocationSetting> for AllocationMode {
    fn from(setting: AllocationSetting) -> Self {
        match setting {
            AllocationSetting::Application => AllocationMode::ApplicationAllocates,
            AllocationSetting::Transport => AllocationMode::TransportAllocates,
        }
    }
}

/// Capture session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Buffer allocation mode.
    pub allocation_mode: AllocationSetting,
    /// Buffers announced per session.
    pub buffer_count: usize,
    /// Timeout of synchronous frame waits.
    pub wait_timeout_ms: u64,
    /// Decode chunk data of completed frames before delivery.
    pub decode_chunks: bool,
    /// Concurrent callback invocations in push mode.
    pub delivery_workers: usize,
    /// Run `GVSPAdjustPacketSize` when opening GigE cameras.
    pub adjust_packet_size: bool,
    /// Stream used for capture.
    pub stream_index: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            allocation_mode: AllocationSetting::Application,
            buffer_count: 5,
            wait_timeout_ms: 1_000,
            decode_chunks: false,
            delivery_workers: 1,
            adjust_packet_size: true,
            stream_index: 0,
        }
    }
}

/// How frames are timed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraMode {
    /// Free-running at `frame_rate`.
    Fixed,
    /// One frame per `TriggerSoftware`.
    Trigger,
    /// Free-running with a fixed exposure of `exposure_us`.
    Exposure,
}

/// ROI preset centred on the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiPreset {
    /// Whole sensor.
    Full,
    /// Half width and half height.
    Quarter,
    /// Quarter width and quarter height.
    Sixteenth,
}

/// Explicit ROI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomRoi {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Horizontal offset.
    #[serde(default)]
    pub offset_x: u32,
    /// Vertical offset.
    #[serde(default)]
    pub offset_y: u32,
}

/// Region of interest: a preset name or an explicit table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoiSetting {
    /// `roi = "quarter"`
    Preset(RoiPreset),
    /// `roi = { width = 320, height = 240 }`
    Custom(CustomRoi),
}

/// Camera setup applied before acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Timing mode.
    pub mode: CameraMode,
    /// Frame rate in Hz for `fixed` mode.
    pub frame_rate: f64,
    /// Exposure time in microseconds for `exposure` mode.
    pub exposure_us: f64,
    /// Region of interest.
    pub roi: RoiSetting,
    /// `ChunkSelector` entries to enable.
    pub chunks: Vec<String>,
    /// Event categories to subscribe to.
    pub events: Vec<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: CameraMode::Fixed,
            frame_rate: 10.0,
            exposure_us: 5_000.0,
            roi: RoiSetting::Preset(RoiPreset::Full),
            chunks: ["Timestamp", "Width", "Height", "ExposureTime"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            events: vec!["AcquisitionStart".to_string()],
        }
    }
}

/// Simulated platform definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Cameras, in enumeration order.
    pub cameras: Vec<SimCameraConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            cameras: vec![SimCameraConfig::default()],
        }
    }
}

impl VmbxConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Figment::from(Serialized::defaults(VmbxConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("VMBX_").split("__"))
            .extract()
            .map_err(|e| VmbError::Config(e.to_string()))
    }

    /// Effective configuration as TOML, loadable with [`load_from`](Self::load_from).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VmbError::Config(e.to_string()))
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(VmbError::Config(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.capture.buffer_count == 0 {
            return Err(VmbError::Config("capture.buffer_count must be at least 1".into()));
        }
        if self.capture.delivery_workers == 0 {
            return Err(VmbError::Config(
                "capture.delivery_workers must be at least 1".into(),
            ));
        }
        if self.capture.wait_timeout_ms == 0 {
            return Err(VmbError::Config(
                "capture.wait_timeout_ms must be greater than 0".into(),
            ));
        }

        if !(self.camera.frame_rate > 0.0 && self.camera.frame_rate <= 30.0) {
            return Err(VmbError::Config(format!(
                "camera.frame_rate {} outside (0, 30]",
                self.camera.frame_rate
            )));
        }
        if self.camera.exposure_us <= 0.0 {
            return Err(VmbError::Config("camera.exposure_us must be positive".into()));
        }
        if let RoiSetting::Custom(roi) = self.camera.roi {
            if roi.width == 0 || roi.height == 0 {
                return Err(VmbError::Config("camera.roi extent must be non-zero".into()));
            }
        }

        let mut ids = HashSet::new();
        for camera in &self.simulation.cameras {
            if !ids.insert(camera.id.as_str()) {
                return Err(VmbError::Config(format!(
                    "duplicate simulated camera id: {}",
                    camera.id
                )));
            }
            if camera.sensor_width == 0 || camera.sensor_height == 0 {
                return Err(VmbError::Config(format!(
                    "simulated camera {} has an empty sensor",
                    camera.id
                )));
            }
        }

        Ok(())
    }
}
