//! Camera setup helpers
//!
//! Writes the feature sequences that put a camera into a known acquisition
//! configuration before `start`:
//! - **Timing**: free-running at a fixed rate, software trigger, or fixed exposure
//! - **ROI**: full sensor, centred presets, or an explicit region
//! - **Chunks**: which chunk entries ride along with every frame
//!
//! All helpers fail on the first rejected write and leave the remaining
//! features untouched. Several of these features are read-only while the
//! camera acquires.

use crate::config::{CameraConfig, CameraMode, RoiPreset, RoiSetting};
use serde::Serialize;
use tracing::{debug, info};
use vmbx_core::feature::{Constraint, FeatureContainer, FeatureType};
use vmbx_core::{Result, VmbError};

// =============================================================================
// Data Structures
// =============================================================================

/// Region of interest as applied to the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roi {
    /// Width in pixels.
    pub width: i64,
    /// Height in pixels.
    pub height: i64,
    /// Horizontal offset.
    pub offset_x: i64,
    /// Vertical offset.
    pub offset_y: i64,
}

impl Roi {
    /// Read the current ROI.
    pub fn read(features: &FeatureContainer) -> Result<Self> {
        Ok(Self {
            width: features.read_int("Width")?,
            height: features.read_int("Height")?,
            offset_x: features.read_int("OffsetX")?,
            offset_y: features.read_int("OffsetY")?,
        })
    }
}

// =============================================================================
// Value snapping
// =============================================================================

fn int_limits(features: &FeatureContainer, name: &str) -> Result<(i64, i64, i64)> {
    match features.get(name)?.constraint {
        Constraint::Integer { min, max, increment } => Ok((min, max, increment.unwrap_or(1).max(1))),
        other => Err(VmbError::TypeMismatch {
            feature: name.to_string(),
            expected: FeatureType::Integer,
            found: other.feature_type(),
        }),
    }
}

/// Largest valid value of `name` not above `value`, clamped to the range.
fn snap_int(features: &FeatureContainer, name: &str, value: i64) -> Result<i64> {
    let (min, max, step) = int_limits(features, name)?;
    let clamped = value.clamp(min, max);
    Ok(min + (clamped - min) / step * step)
}

/// Nearest valid value of a float feature, honouring its increment.
fn snap_float(features: &FeatureContainer, name: &str, value: f64) -> Result<f64> {
    match features.get(name)?.constraint {
        Constraint::Float { min, max, increment } => {
            let snapped = match increment {
                Some(step) if step > 0.0 => min + ((value - min) / step).round() * step,
                _ => value,
            };
            Ok(snapped.clamp(min, max))
        }
        other => Err(VmbError::TypeMismatch {
            feature: name.to_string(),
            expected: FeatureType::Float,
            found: other.feature_type(),
        }),
    }
}

// =============================================================================
// Timing modes
// =============================================================================

fn free_running(features: &FeatureContainer) -> Result<()> {
    features.write_entry("TriggerSelector", "FrameStart")?;
    features.write_entry("TriggerMode", "Off")?;
    features.write_entry("AcquisitionMode", "Continuous")
}

/// Free-running at `rate` Hz.
pub fn set_fixed_rate(features: &FeatureContainer, rate: f64) -> Result<()> {
    free_running(features)?;
    features.write("AcquisitionFrameRateEnable", true)?;
    features.write("AcquisitionFrameRate", rate)?;
    info!(rate, "Fixed frame rate mode");
    Ok(())
}

/// One frame per `TriggerSoftware` command.
pub fn set_software_trigger(features: &FeatureContainer) -> Result<()> {
    features.write("AcquisitionFrameRateEnable", false)?;
    features.write_entry("AcquisitionMode", "Continuous")?;
    features.write_entry("TriggerSelector", "FrameStart")?;
    features.write_entry("TriggerMode", "On")?;
    features.write_entry("TriggerSource", "Software")?;
    info!("Software trigger mode");
    Ok(())
}

/// Free-running with a fixed exposure. Returns the exposure actually set,
/// snapped to the feature's increment and range.
pub fn set_exposure(features: &FeatureContainer, exposure_us: f64) -> Result<f64> {
    free_running(features)?;
    features.write("AcquisitionFrameRateEnable", false)?;
    features.write_entry("ExposureAuto", "Off")?;
    features.write_entry("GainAuto", "Off")?;
    features.write("Gain", 0.0)?;
    let exposure = snap_float(features, "ExposureTime", exposure_us)?;
    features.write("ExposureTime", exposure)?;
    info!(requested = exposure_us, exposure, "Fixed exposure mode");
    Ok(exposure)
}

// =============================================================================
// Region of interest
// =============================================================================

/// Apply an ROI. Offsets are reset first because their range depends on
/// the extent. Returns the ROI read back from the camera.
pub fn set_roi(features: &FeatureContainer, roi: &RoiSetting) -> Result<Roi> {
    let sensor_width = features.read_int("WidthMax")?;
    let sensor_height = features.read_int("HeightMax")?;
    let (width, height, centred, offset_x, offset_y) = match roi {
        RoiSetting::Preset(RoiPreset::Full) => (sensor_width, sensor_height, false, 0, 0),
        RoiSetting::Preset(RoiPreset::Quarter) => (sensor_width / 2, sensor_height / 2, true, 0, 0),
        RoiSetting::Preset(RoiPreset::Sixteenth) => (sensor_width / 4, sensor_height / 4, true, 0, 0),
        RoiSetting::Custom(custom) => (
            i64::from(custom.width),
            i64::from(custom.height),
            false,
            i64::from(custom.offset_x),
            i64::from(custom.offset_y),
        ),
    };

    features.write("OffsetX", 0i64)?;
    features.write("OffsetY", 0i64)?;
    let width = snap_int(features, "Width", width)?;
    features.write("Width", width)?;
    let height = snap_int(features, "Height", height)?;
    features.write("Height", height)?;

    let (offset_x, offset_y) = if centred {
        ((sensor_width - width) / 2, (sensor_height - height) / 2)
    } else {
        (offset_x, offset_y)
    };
    let offset_x = snap_int(features, "OffsetX", offset_x)?;
    features.write("OffsetX", offset_x)?;
    let offset_y = snap_int(features, "OffsetY", offset_y)?;
    features.write("OffsetY", offset_y)?;

    let applied = Roi::read(features)?;
    info!(
        width = applied.width,
        height = applied.height,
        offset_x = applied.offset_x,
        offset_y = applied.offset_y,
        "ROI applied"
    );
    Ok(applied)
}

// =============================================================================
// Chunk data
// =============================================================================

/// Enable exactly the `ChunkSelector` entries in `entries`.
///
/// Chunk mode is switched off while the selection changes and switched back
/// on only if at least one entry is enabled.
pub fn enable_chunks(features: &FeatureContainer, entries: &[String]) -> Result<()> {
    features.write("ChunkModeActive", false)?;
    for entry in features.list_entries("ChunkSelector")? {
        features.write_entry("ChunkSelector", &entry)?;
        features.write("ChunkEnable", false)?;
    }
    for entry in entries {
        features.write_entry("ChunkSelector", entry)?;
        features.write("ChunkEnable", true)?;
        debug!(chunk = %entry, "Chunk enabled");
    }
    if !entries.is_empty() {
        features.write("ChunkModeActive", true)?;
    }
    info!(chunks = entries.len(), "Chunk selection applied");
    Ok(())
}

/// Apply a full camera configuration: timing mode, ROI, then chunks.
pub fn apply(features: &FeatureContainer, config: &CameraConfig) -> Result<Roi> {
    match config.mode {
        CameraMode::Fixed => set_fixed_rate(features, config.frame_rate)?,
        CameraMode::Trigger => set_software_trigger(features)?,
        CameraMode::Exposure => {
            set_exposure(features, config.exposure_us)?;
        }
    }
    let roi = set_roi(features, &config.roi)?;
    enable_chunks(features, &config.chunks)?;
    Ok(roi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CustomRoi;
    use vmbx_core::module::InterfaceKind;
    use vmbx_core::platform::{CameraDevice, Transport};
    use vmbx_sim::{SimCameraConfig, SimTransport};
    use std::sync::Arc;

    async fn camera() -> Arc<dyn CameraDevice> {
        let transport = SimTransport::new(vec![SimCameraConfig::small("DEV_A", InterfaceKind::Usb)]);
        transport.open_camera("DEV_A").await.unwrap()
    }

    #[tokio::test]
    async fn test_quarter_roi_is_centred() {
        let cam = camera().await;
        let f = cam.remote_features();
        let roi = set_roi(&f, &RoiSetting::Preset(RoiPreset::Quarter)).unwrap();
        assert_eq!(
            roi,
            Roi {
                width: 32,
                height: 24,
                offset_x: 16,
                offset_y: 12
            }
        );
        assert_eq!(f.read_int("PayloadSize").unwrap(), 32 * 24);

        // Back to full size works although the old offsets would not fit.
        let roi = set_roi(&f, &RoiSetting::Preset(RoiPreset::Full)).unwrap();
        assert_eq!((roi.width, roi.offset_x), (64, 0));
    }

    #[tokio::test]
    async fn test_custom_roi_snaps_to_increment() {
        let cam = camera().await;
        let f = cam.remote_features();
        let roi = set_roi(
            &f,
            &RoiSetting::Custom(CustomRoi {
                width: 30,
                height: 21,
                offset_x: 9,
                offset_y: 3,
            }),
        )
        .unwrap();
        assert_eq!(roi.width, 24);
        assert_eq!(roi.height, 20);
        assert_eq!(roi.offset_x, 8);
        assert_eq!(roi.offset_y, 2);
    }

    #[tokio::test]
    async fn test_trigger_mode_features() {
        let cam = camera().await;
        let f = cam.remote_features();
        set_software_trigger(&f).unwrap();
        assert_eq!(f.read_selected("TriggerMode", "FrameStart").unwrap().as_str(), Some("On"));
        assert_eq!(f.read_enum("TriggerSource").unwrap(), "Software");
        assert!(!f.read_bool("AcquisitionFrameRateEnable").unwrap());

        set_fixed_rate(&f, 20.0).unwrap();
        assert_eq!(f.read_enum("TriggerMode").unwrap(), "Off");
        assert_eq!(f.read_float("AcquisitionFrameRate").unwrap(), 20.0);
        assert!(set_fixed_rate(&f, 60.0).is_err());
    }

    #[tokio::test]
    async fn test_exposure_is_clamped() {
        let cam = camera().await;
        let f = cam.remote_features();
        assert_eq!(set_exposure(&f, 1234.4).unwrap(), 1234.0);
        assert_eq!(set_exposure(&f, 1.0).unwrap(), 10.0);
        assert_eq!(f.read_float("ExposureTime").unwrap(), 10.0);
        assert_eq!(f.read_enum("GainAuto").unwrap(), "Off");
    }

    #[tokio::test]
    async fn test_chunk_selection() {
        let cam = camera().await;
        let f = cam.remote_features();
        enable_chunks(&f, &["Width".to_string(), "FrameID".to_string()]).unwrap();
        assert!(f.read_bool("ChunkModeActive").unwrap());
        assert_eq!(f.read_selected("ChunkEnable", "Width").unwrap().as_bool(), Some(true));
        assert_eq!(f.read_selected("ChunkEnable", "Height").unwrap().as_bool(), Some(false));

        enable_chunks(&f, &[]).unwrap();
        assert!(!f.read_bool("ChunkModeActive").unwrap());
        assert_eq!(f.read_selected("ChunkEnable", "Width").unwrap().as_bool(), Some(false));

        assert!(enable_chunks(&f, &["Bogus".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_snapping_reports_feature_types() {
        let cam = camera().await;
        let f = cam.remote_features();
        assert!(matches!(
            snap_int(&f, "Gain", 3),
            Err(VmbError::TypeMismatch {
                expected: FeatureType::Integer,
                found: FeatureType::Float,
                ..
            })
        ));
        assert!(matches!(
            snap_float(&f, "Width", 3.0),
            Err(VmbError::TypeMismatch {
                expected: FeatureType::Float,
                found: FeatureType::Integer,
                ..
            })
        ));
    }
}
