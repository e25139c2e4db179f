//! `vmbx-core`
//!
//! Shared building blocks of the vmbx camera stack.
//!
//! ## Modules
//!
//! - [`feature`]: typed, introspectable feature model per device module
//! - [`frame`]: capture results and their buffers
//! - [`chunk`]: decoder for per-frame chunk data
//! - [`event`]: device event notification channel
//! - [`module`]: descriptors returned by enumeration
//! - [`platform`]: traits the transport layer implements
//! - [`error`]: the [`VmbError`] taxonomy
//!
//! ## Example
//!
//! ```rust,no_run
//! use vmbx_core::prelude::*;
//!
//! fn dump(features: &FeatureContainer) {
//!     for name in features.feature_names() {
//!         println!("{name} = {}", features.display_value(&name));
//!     }
//! }
//! ```

pub mod chunk;
pub mod error;
pub mod event;
pub mod feature;
pub mod frame;
pub mod module;
pub mod platform;

pub use error::{DeviceFault, DeviceFaultKind, Result, VmbError};

/// Common imports.
pub mod prelude {
    pub use crate::chunk::{ChunkDecoder, ChunkFeatures, ChunkLayout};
    pub use crate::error::{Result, VmbError};
    pub use crate::event::{EventChannel, EventOccurrence, Subscription};
    pub use crate::feature::{
        Access, Feature, FeatureContainer, FeatureInfo, FeatureSource, FeatureType, FeatureValue,
    };
    pub use crate::frame::{Frame, FrameBuffer, FrameStatus, PixelFormat};
    pub use crate::module::{InterfaceKind, ModuleDescriptor, ModuleKind};
    pub use crate::platform::{CameraDevice, StreamDevice, Transport};
}
