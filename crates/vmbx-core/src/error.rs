//! Error types shared by every vmbx crate.
//!
//! `VmbError` covers the failures a caller can observe when talking to a
//! camera through this stack:
//!
//! - **Lookup**: `NotFound`, `NotAvailable`, `NotImplemented`
//! - **Access and value contract**: `InvalidAccess`, `TypeMismatch`, `OutOfRange`
//! - **Lifecycle**: `InvalidState`, `AlreadyOpen`, `InvalidIndex`
//! - **Acquisition**: `Timeout`, `Aborted`, `AllocationError`, `NoChunkData`
//! - **Platform**: `Device` wraps a structured [`DeviceFault`]
//!
//! Incomplete frames are not errors; they are a frame status the consumer
//! branches on.

use crate::feature::FeatureType;
use std::time::Duration;
use thiserror::Error;
use vmbx_pool::PoolError;

/// Category of a device or transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFaultKind {
    /// Link to the device dropped or timed out at the transport level.
    Communication,
    /// The device reported an internal fault.
    Hardware,
    /// The device did not answer in time.
    Timeout,
    /// The device rejected its configuration.
    Configuration,
}

impl std::fmt::Display for DeviceFaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DeviceFaultKind::Communication => "communication",
            DeviceFaultKind::Hardware => "hardware",
            DeviceFaultKind::Timeout => "timeout",
            DeviceFaultKind::Configuration => "configuration",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by the underlying platform for one module.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Module '{module}' {kind} fault: {message}")]
pub struct DeviceFault {
    /// Id of the module (camera, stream, interface) that failed.
    pub module: String,
    /// Fault category.
    pub kind: DeviceFaultKind,
    /// Human readable detail.
    pub message: String,
}

impl DeviceFault {
    /// Build a fault for `module`.
    pub fn new(module: impl Into<String>, kind: DeviceFaultKind, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Convenience alias used across the workspace.
pub type Result<T> = std::result::Result<T, VmbError>;

/// Primary error type.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VmbError {
    /// A named entity (feature, camera, enum entry, module) does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity exists but cannot be accessed in the current device state.
    ///
    /// Typical causes: a selector hides the feature, or an enumeration entry
    /// is currently invalid.
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// The access mode forbids the operation, e.g. writing a read-only feature.
    #[error("Invalid access: {0}")]
    InvalidAccess(String),

    /// The device does not support this feature or selector.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The operation is not valid in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A bounded wait elapsed without the awaited event.
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A wait was cancelled because acquisition stopped.
    #[error("Wait aborted: acquisition stopped")]
    Aborted,

    /// Buffer setup for a capture session failed.
    #[error("Buffer allocation failed: {0}")]
    AllocationError(String),

    /// Underlying hardware or transport failure.
    #[error(transparent)]
    Device(#[from] DeviceFault),

    /// A value of the wrong type was supplied for a feature.
    #[error("Feature '{feature}' is {expected:?}, not {found:?}")]
    TypeMismatch {
        /// Feature name.
        feature: String,
        /// Type tag of the feature.
        expected: FeatureType,
        /// Type of the supplied value.
        found: FeatureType,
    },

    /// A value lies outside the feature's declared range or size.
    #[error("Value {value} out of range for '{feature}' [{min}, {max}]")]
    OutOfRange {
        /// Feature name.
        feature: String,
        /// Offending value, formatted.
        value: String,
        /// Lower bound, formatted.
        min: String,
        /// Upper bound, formatted.
        max: String,
    },

    /// The frame carries no chunk data.
    #[error("Frame contains no chunk data")]
    NoChunkData,

    /// The module is already opened by another handle.
    #[error("Already open: {0}")]
    AlreadyOpen(String),

    /// No stream exists at this index.
    #[error("Invalid stream index {0}")]
    InvalidIndex(usize),

    /// Configuration could not be loaded or is semantically invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VmbError {
    /// Shorthand for a device fault.
    pub fn device(module: impl Into<String>, kind: DeviceFaultKind, message: impl Into<String>) -> Self {
        Self::Device(DeviceFault::new(module, kind, message))
    }

    /// True for `Timeout` and `Aborted`, the two ways a frame wait ends empty.
    #[must_use]
    pub fn is_wait_ended(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Aborted)
    }
}

impl From<PoolError> for VmbError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Timeout(after) => VmbError::Timeout(after),
            PoolError::WrongState { .. } | PoolError::OnLoan(_) => {
                VmbError::InvalidState(err.to_string())
            }
            PoolError::UnknownHandle(_) => VmbError::NotFound(err.to_string()),
            PoolError::ZeroCapacity
            | PoolError::CapacityReached { .. }
            | PoolError::ModeMismatch { .. }
            | PoolError::Desync => VmbError::AllocationError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_fault_display() {
        let err = VmbError::device("DEV_1", DeviceFaultKind::Hardware, "sensor fault");
        assert_eq!(err.to_string(), "Module 'DEV_1' hardware fault: sensor fault");
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = VmbError::TypeMismatch {
            feature: "Width".into(),
            expected: FeatureType::Integer,
            found: FeatureType::Float,
        };
        assert_eq!(err.to_string(), "Feature 'Width' is Integer, not Float");
    }

    #[test]
    fn test_pool_error_mapping() {
        let timeout: VmbError = PoolError::Timeout(Duration::from_millis(5)).into();
        assert_eq!(timeout, VmbError::Timeout(Duration::from_millis(5)));
        assert!(timeout.is_wait_ended());

        let full: VmbError = PoolError::CapacityReached { capacity: 3 }.into();
        assert!(matches!(full, VmbError::AllocationError(_)));

        let loaned: VmbError = PoolError::OnLoan(1).into();
        assert!(matches!(loaned, VmbError::InvalidState(_)));
    }
}
