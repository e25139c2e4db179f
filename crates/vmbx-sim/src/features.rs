//! Feature trees of the simulated modules, named after the standard
//! feature naming convention.
//!
//! Device behaviour (commands, locking, derived values) is attached later by
//! the camera and stream modules; these functions only declare features.

use crate::SimCameraConfig;
use vmbx_core::chunk::ChunkLayout;
use vmbx_core::event::{EVENT_NOTIFICATION, EVENT_SELECTOR};
use vmbx_core::feature::{Condition, Feature, FeatureContainer, FeatureValue, Visibility};
use vmbx_core::frame::PixelFormat;
use vmbx_core::module::InterfaceKind;

/// Event categories every simulated camera raises.
pub const EVENT_CATEGORIES: [&str; 2] = ["AcquisitionStart", "AcquisitionEnd"];

/// Size of the largest possible chunk trailer for `layout`.
#[must_use]
pub fn max_trailer_size(layout: &ChunkLayout) -> usize {
    layout.descriptors().len() * 16
}

/// Transport layer features.
pub fn transport_layer(id: &str) -> FeatureContainer {
    let f = FeatureContainer::new(format!("{}/transport-layer", id));
    f.insert(Feature::string("TLID", 64).with_value(id).read_only());
    f.insert(Feature::string("TLVendorName", 64).with_value("vmbx").read_only());
    f.insert(
        Feature::string("TLModelName", 64)
            .with_value("Simulated Transport Layer")
            .read_only(),
    );
    f.insert(
        Feature::enumeration("TLType", &["Mixed", "GEV", "U3V"])
            .read_only()
            .with_tooltip("Transport technologies served by this layer"),
    );
    f.insert(Feature::string("TLVersion", 16).with_value("1.0.0").read_only());
    f
}

/// Interface features.
pub fn interface(id: &str, kind: InterfaceKind, cameras: i64) -> FeatureContainer {
    let f = FeatureContainer::new(format!("{}/interface", id));
    f.insert(Feature::string("InterfaceID", 64).with_value(id).read_only());
    f.insert(
        Feature::enumeration("InterfaceType", &["GigEVision", "USB3Vision"])
            .with_value(FeatureValue::entry(match kind {
                InterfaceKind::GigE => "GigEVision",
                InterfaceKind::Usb => "USB3Vision",
            }))
            .read_only(),
    );
    f.insert(Feature::integer("DeviceCount", 0, 64).with_value(cameras).read_only());
    f
}

/// Remote device (camera) features.
pub fn camera(cfg: &SimCameraConfig, layout: &ChunkLayout) -> FeatureContainer {
    let f = FeatureContainer::new(format!("{}/camera", cfg.id));
    let (sw, sh) = (i64::from(cfg.sensor_width), i64::from(cfg.sensor_height));

    // Device identity
    f.insert(Feature::string("DeviceVendorName", 64).with_value("vmbx").read_only());
    f.insert(Feature::string("DeviceModelName", 64).with_value(cfg.model.as_str()).read_only());
    f.insert(
        Feature::string("DeviceSerialNumber", 64)
            .with_value(cfg.serial.as_str())
            .read_only(),
    );
    f.insert(Feature::string("DeviceFirmwareVersion", 32).with_value("00.01.00").read_only());
    f.insert(
        Feature::string("DeviceUserID", 64)
            .with_value("")
            .with_tooltip("User-programmable device name"),
    );
    f.insert(
        Feature::float("DeviceTemperature", -40.0, 120.0)
            .with_value(41.5)
            .with_unit("C")
            .read_only()
            .with_visibility(Visibility::Expert),
    );

    // Image format
    f.insert(Feature::integer("SensorWidth", sw, sw).with_value(sw).read_only());
    f.insert(Feature::integer("SensorHeight", sh, sh).with_value(sh).read_only());
    f.insert(Feature::integer("WidthMax", sw, sw).with_value(sw).read_only());
    f.insert(Feature::integer("HeightMax", sh, sh).with_value(sh).read_only());
    f.insert(
        Feature::integer("Width", 8, sw)
            .with_increment(8i64)
            .with_value(sw)
            .with_unit("px"),
    );
    f.insert(
        Feature::integer("Height", 8, sh)
            .with_increment(2i64)
            .with_value(sh)
            .with_unit("px"),
    );
    f.insert(Feature::integer("OffsetX", 0, 0).with_increment(8i64).with_value(0i64));
    f.insert(Feature::integer("OffsetY", 0, 0).with_increment(2i64).with_value(0i64));
    f.insert(Feature::enumeration(
        "PixelFormat",
        &[
            PixelFormat::Mono8.as_str(),
            PixelFormat::Mono10.as_str(),
            PixelFormat::Mono12.as_str(),
            PixelFormat::Mono16.as_str(),
        ],
    ));
    f.insert(
        Feature::integer("PayloadSize", 0, i64::MAX)
            .with_value(sw * sh + max_trailer_size(layout) as i64)
            .with_unit("B")
            .read_only(),
    );

    // Acquisition control
    f.insert(Feature::enumeration(
        "AcquisitionMode",
        &["Continuous", "SingleFrame", "MultiFrame"],
    ));
    f.insert(
        Feature::integer("AcquisitionFrameCount", 1, 65_535)
            .with_value(10i64)
            .available_when(Condition::equals(
                "AcquisitionMode",
                FeatureValue::entry("MultiFrame"),
            )),
    );
    f.insert(Feature::command("AcquisitionStart"));
    f.insert(Feature::command("AcquisitionStop"));
    f.insert(Feature::boolean("AcquisitionFrameRateEnable").with_value(false));
    f.insert(
        Feature::float("AcquisitionFrameRate", 0.1, 30.0)
            .with_value(30.0)
            .with_unit("Hz")
            .available_when(Condition::equals("AcquisitionFrameRateEnable", true)),
    );
    f.insert(
        Feature::enumeration("TriggerSelector", &["FrameStart", "AcquisitionStart"]).as_selector(),
    );
    f.insert(Feature::enumeration("TriggerMode", &["Off", "On"]).selected_by("TriggerSelector"));
    f.insert(
        Feature::enumeration("TriggerSource", &["Software", "Line0"]).selected_by("TriggerSelector"),
    );
    f.insert(Feature::command("TriggerSoftware"));
    f.insert(Feature::enumeration("ExposureAuto", &["Off", "Once", "Continuous"]));
    f.insert(
        Feature::float("ExposureTime", 10.0, 1_000_000.0)
            .with_value(5_000.0)
            .with_increment(1.0)
            .with_unit("us")
            .available_when(Condition::not_equals(
                "ExposureAuto",
                FeatureValue::entry("Continuous"),
            )),
    );
    f.insert(Feature::enumeration("GainAuto", &["Off", "Once", "Continuous"]));
    f.insert(
        Feature::float("Gain", 0.0, 48.0)
            .with_value(0.0)
            .with_increment(0.1)
            .with_unit("dB"),
    );

    // Chunk data
    f.insert(Feature::boolean("ChunkModeActive").with_value(false));
    let entries: Vec<&str> = layout
        .descriptors()
        .iter()
        .map(|d| d.selector_entry.as_str())
        .collect();
    f.insert(Feature::enumeration("ChunkSelector", &entries).as_selector());
    f.insert(
        Feature::boolean("ChunkEnable")
            .with_value(false)
            .selected_by("ChunkSelector"),
    );

    // Events
    f.insert(Feature::enumeration(EVENT_SELECTOR, &EVENT_CATEGORIES).as_selector());
    f.insert(Feature::enumeration(EVENT_NOTIFICATION, &["Off", "On"]).selected_by(EVENT_SELECTOR));
    for category in EVENT_CATEGORIES {
        f.insert(
            Feature::integer(&format!("Event{}", category), 0, i64::MAX)
                .with_value(0i64)
                .read_only()
                .with_visibility(Visibility::Expert),
        );
        f.insert(
            Feature::integer(&format!("Event{}Timestamp", category), 0, i64::MAX)
                .with_value(0i64)
                .with_unit("ns")
                .read_only()
                .with_visibility(Visibility::Expert),
        );
    }

    f
}

/// Host-side local device features.
pub fn local_device(cfg: &SimCameraConfig) -> FeatureContainer {
    let f = FeatureContainer::new(format!("{}/local-device", cfg.id));
    f.insert(Feature::string("DeviceID", 64).with_value(cfg.id.as_str()).read_only());
    f.insert(
        Feature::enumeration("DeviceAccessStatus", &["ReadWrite", "ReadOnly", "NoAccess"])
            .read_only(),
    );
    f.insert(
        Feature::integer("DeviceLinkSpeed", 0, i64::MAX)
            .with_value(match cfg.interface {
                InterfaceKind::GigE => 125_000_000i64,
                InterfaceKind::Usb => 450_000_000i64,
            })
            .with_unit("Bps")
            .read_only(),
    );
    f
}

/// Stream module features.
pub fn stream(cfg: &SimCameraConfig, index: usize) -> FeatureContainer {
    let f = FeatureContainer::new(format!("{}/stream{}", cfg.id, index));
    f.insert(
        Feature::string("StreamID", 64)
            .with_value(format!("{}#{}", cfg.id, index))
            .read_only(),
    );
    f.insert(Feature::integer("StreamAnnouncedBufferMinimum", 1, 1).with_value(1i64).read_only());
    f.insert(Feature::enumeration(
        "StreamBufferHandlingMode",
        &["OldestFirst"],
    ));
    f.insert(
        Feature::integer("StreamDeliveredFrameCount", 0, i64::MAX)
            .with_value(0i64)
            .read_only(),
    );
    f.insert(
        Feature::integer("StreamIncompleteFrameCount", 0, i64::MAX)
            .with_value(0i64)
            .read_only(),
    );
    if cfg.interface == InterfaceKind::GigE {
        f.insert(Feature::command("GVSPAdjustPacketSize").with_visibility(Visibility::Expert));
        f.insert(
            Feature::integer("GVSPPacketSize", 576, 9_000)
                .with_value(1_500i64)
                .with_unit("B")
                .read_only()
                .with_visibility(Visibility::Expert),
        );
    }
    f
}
