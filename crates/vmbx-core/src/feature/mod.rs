//! Typed, introspectable device features.
//!
//! Every module (transport layer, interface, camera, local device, stream)
//! exposes its properties as named [`Feature`]s collected in a
//! [`FeatureContainer`]. A feature's type tag never changes, and reads and
//! writes must match it: a mismatch fails with
//! [`VmbError::TypeMismatch`](crate::VmbError::TypeMismatch) instead of
//! coercing.
//!
//! # Constraints
//!
//! | Type        | Constraint                                  |
//! |-------------|---------------------------------------------|
//! | Integer     | `min..=max`, optional increment              |
//! | Float       | `min..=max`, optional increment              |
//! | Boolean     | none                                         |
//! | String      | maximum length                               |
//! | Enumeration | ordered entries (name, code, currently valid)|
//! | Raw         | maximum byte size                            |
//! | Command     | run / is-done only                           |
//!
//! # Selectors
//!
//! A selector is an enumeration that decides which slot of its selected
//! features a read or write addresses (`EventSelector` picks which event
//! `EventNotification` applies to). Writing a selector, or any feature that
//! an availability rule looks at, makes the container re-evaluate which
//! features are available.
//!
//! # Example
//!
//! ```
//! use vmbx_core::feature::{Feature, FeatureContainer, FeatureValue};
//!
//! let features = FeatureContainer::new("DEV_1/camera");
//! features.insert(Feature::integer("Width", 8, 4128).with_increment(8).with_value(4128i64));
//! features.write("Width", 2064i64).unwrap();
//! assert_eq!(features.read("Width").unwrap(), FeatureValue::Integer(2064));
//! assert!(features.write("Width", 9000i64).is_err());
//! ```

mod container;

pub use container::{ChangeSubscription, FeatureContainer, WeakFeatureContainer};

use crate::error::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Type tag of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FeatureType {
    /// Signed 64-bit integer.
    Integer,
    /// 64-bit float.
    Float,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
    /// Named entry out of an ordered set.
    Enumeration,
    /// Opaque bytes.
    Raw,
    /// Executable action without a value.
    Command,
}

impl fmt::Display for FeatureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeatureType::Integer => "Integer",
            FeatureType::Float => "Float",
            FeatureType::Boolean => "Boolean",
            FeatureType::String => "String",
            FeatureType::Enumeration => "Enumeration",
            FeatureType::Raw => "Raw",
            FeatureType::Command => "Command",
        };
        f.write_str(label)
    }
}

/// A feature value, tagged with its type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum FeatureValue {
    /// Integer value.
    Integer(i64),
    /// Float value.
    Float(f64),
    /// Boolean value.
    Boolean(bool),
    /// String value.
    String(String),
    /// Name of the selected enumeration entry.
    Enumeration(String),
    /// Raw bytes.
    Raw(Vec<u8>),
}

impl FeatureValue {
    /// Type tag matching this value.
    #[must_use]
    pub fn feature_type(&self) -> FeatureType {
        match self {
            FeatureValue::Integer(_) => FeatureType::Integer,
            FeatureValue::Float(_) => FeatureType::Float,
            FeatureValue::Boolean(_) => FeatureType::Boolean,
            FeatureValue::String(_) => FeatureType::String,
            FeatureValue::Enumeration(_) => FeatureType::Enumeration,
            FeatureValue::Raw(_) => FeatureType::Raw,
        }
    }

    /// Build an enumeration value from an entry name.
    pub fn entry(name: impl Into<String>) -> Self {
        FeatureValue::Enumeration(name.into())
    }

    /// Integer payload, if this is an integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload, if this is a float.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean payload, if this is a boolean.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload for strings and enumeration entries.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(v) | FeatureValue::Enumeration(v) => Some(v),
            _ => None,
        }
    }

    /// Raw payload, if this is a raw value.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FeatureValue::Raw(v) => Some(v),
            _ => None,
        }
    }
}

/// Display value used by introspection tooling.
impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Integer(v) => write!(f, "{}", v),
            FeatureValue::Float(v) => write!(f, "{}", v),
            FeatureValue::Boolean(v) => write!(f, "{}", v),
            FeatureValue::String(v) | FeatureValue::Enumeration(v) => f.write_str(v),
            FeatureValue::Raw(bytes) => {
                write!(f, "[{} bytes]", bytes.len())?;
                for b in bytes.iter().take(16) {
                    write!(f, " {:02x}", b)?;
                }
                if bytes.len() > 16 {
                    f.write_str(" ..")?;
                }
                Ok(())
            }
        }
    }
}

impl From<i64> for FeatureValue {
    fn from(v: i64) -> Self {
        FeatureValue::Integer(v)
    }
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Float(v)
    }
}

impl From<bool> for FeatureValue {
    fn from(v: bool) -> Self {
        FeatureValue::Boolean(v)
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::String(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::String(v.to_string())
    }
}

impl From<Vec<u8>> for FeatureValue {
    fn from(v: Vec<u8>) -> Self {
        FeatureValue::Raw(v)
    }
}

/// Access mode of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Access {
    /// Readable only.
    ReadOnly,
    /// Writable only.
    WriteOnly,
    /// Readable and writable.
    ReadWrite,
}

impl Access {
    /// True when reads are permitted.
    #[must_use]
    pub fn readable(&self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }

    /// True when writes are permitted.
    #[must_use]
    pub fn writable(&self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }
}

/// Intended audience of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Visibility {
    /// Shown to every user.
    Beginner,
    /// Advanced settings.
    Expert,
    /// Low-level tuning.
    Guru,
    /// Not meant for user interfaces.
    Invisible,
}

/// Naming standard a feature belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Namespace {
    /// Defined by the standard feature naming convention.
    Standard,
    /// Vendor specific.
    Custom,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Standard => f.write_str("Standard"),
            Namespace::Custom => f.write_str("Custom"),
        }
    }
}

/// One entry of an enumeration feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumEntry {
    /// Entry name, unique within the feature.
    pub name: String,
    /// Underlying numeric code.
    pub code: i64,
    /// Whether the entry can currently be selected.
    pub available: bool,
}

impl EnumEntry {
    /// A currently valid entry.
    pub fn new(name: impl Into<String>, code: i64) -> Self {
        Self {
            name: name.into(),
            code,
            available: true,
        }
    }
}

/// Value constraint attached to a feature. Also determines its type tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Constraint {
    /// Integer range.
    Integer {
        /// Minimum.
        min: i64,
        /// Maximum.
        max: i64,
        /// Step between valid values, counted from `min`.
        increment: Option<i64>,
    },
    /// Float range.
    Float {
        /// Minimum.
        min: f64,
        /// Maximum.
        max: f64,
        /// Suggested step.
        increment: Option<f64>,
    },
    /// Boolean.
    Boolean,
    /// String with a maximum length.
    String {
        /// Maximum length in bytes.
        max_length: usize,
    },
    /// Enumeration.
    Enumeration {
        /// Entries in declaration order.
        entries: Vec<EnumEntry>,
    },
    /// Raw bytes with a maximum size.
    Raw {
        /// Maximum size in bytes.
        max_size: usize,
    },
    /// Command.
    Command,
}

impl Constraint {
    /// Type tag implied by this constraint.
    #[must_use]
    pub fn feature_type(&self) -> FeatureType {
        match self {
            Constraint::Integer { .. } => FeatureType::Integer,
            Constraint::Float { .. } => FeatureType::Float,
            Constraint::Boolean => FeatureType::Boolean,
            Constraint::String { .. } => FeatureType::String,
            Constraint::Enumeration { .. } => FeatureType::Enumeration,
            Constraint::Raw { .. } => FeatureType::Raw,
            Constraint::Command => FeatureType::Command,
        }
    }
}

/// Static description of a feature, serializable for tooling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureInfo {
    /// Unique name within the owning module.
    pub name: String,
    /// Human readable name.
    pub display_name: String,
    /// Short help text.
    pub tooltip: String,
    /// Long description.
    pub description: String,
    /// Naming standard.
    pub namespace: Namespace,
    /// Type tag.
    pub feature_type: FeatureType,
    /// Access mode.
    pub access: Access,
    /// Audience.
    pub visibility: Visibility,
    /// Physical unit, if any.
    pub unit: Option<String>,
    /// Value constraint.
    pub constraint: Constraint,
    /// Selector deciding which slot this feature addresses.
    pub selected_by: Option<String>,
    /// Whether this feature is a selector.
    pub is_selector: bool,
}

/// Availability rule: the feature is available only while `feature` holds `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Feature inspected by the rule.
    pub feature: String,
    /// Value it must hold.
    pub value: FeatureValue,
    /// Invert the comparison.
    pub negate: bool,
}

impl Condition {
    /// Available while `feature == value`.
    pub fn equals(feature: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        Self {
            feature: feature.into(),
            value: value.into(),
            negate: false,
        }
    }

    /// Available while `feature != value`.
    pub fn not_equals(feature: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        Self {
            feature: feature.into(),
            value: value.into(),
            negate: true,
        }
    }
}

/// What a feature hook is asked to do.
#[derive(Debug, Clone, Copy)]
pub enum HookAction<'a> {
    /// A validated value is about to be stored.
    Write(&'a FeatureValue),
    /// A command is being run.
    Run,
}

/// Device-side handler bound to a feature.
///
/// Called without any container lock held, after validation and before the
/// value is stored. An error leaves the stored value unchanged.
pub type FeatureHook = Arc<dyn Fn(HookAction<'_>) -> Result<()> + Send + Sync>;

/// A feature definition plus its current state.
///
/// Built with the `with_*` methods, then inserted into a [`FeatureContainer`].
#[derive(Clone)]
pub struct Feature {
    pub(crate) info: FeatureInfo,
    pub(crate) default: Option<FeatureValue>,
    pub(crate) conditions: Vec<Condition>,
    pub(crate) hook: Option<FeatureHook>,
}

impl Feature {
    fn with_constraint(name: &str, constraint: Constraint) -> Self {
        Self {
            info: FeatureInfo {
                name: name.to_string(),
                display_name: name.to_string(),
                tooltip: String::new(),
                description: String::new(),
                namespace: Namespace::Standard,
                feature_type: constraint.feature_type(),
                access: if matches!(constraint, Constraint::Command) {
                    Access::WriteOnly
                } else {
                    Access::ReadWrite
                },
                visibility: Visibility::Beginner,
                unit: None,
                constraint,
                selected_by: None,
                is_selector: false,
            },
            default: None,
            conditions: Vec::new(),
            hook: None,
        }
    }

    /// Integer feature with an inclusive range.
    #[must_use]
    pub fn integer(name: &str, min: i64, max: i64) -> Self {
        Self::with_constraint(
            name,
            Constraint::Integer {
                min,
                max,
                increment: None,
            },
        )
    }

    /// Float feature with an inclusive range.
    #[must_use]
    pub fn float(name: &str, min: f64, max: f64) -> Self {
        Self::with_constraint(
            name,
            Constraint::Float {
                min,
                max,
                increment: None,
            },
        )
    }

    /// Boolean feature.
    #[must_use]
    pub fn boolean(name: &str) -> Self {
        Self::with_constraint(name, Constraint::Boolean)
    }

    /// String feature.
    #[must_use]
    pub fn string(name: &str, max_length: usize) -> Self {
        Self::with_constraint(name, Constraint::String { max_length })
    }

    /// Enumeration feature. Entry codes follow declaration order.
    #[must_use]
    pub fn enumeration(name: &str, entries: &[&str]) -> Self {
        let entries = entries
            .iter()
            .enumerate()
            .map(|(code, entry)| EnumEntry::new(*entry, code as i64))
            .collect();
        Self::with_constraint(name, Constraint::Enumeration { entries })
    }

    /// Enumeration feature with explicit entries.
    #[must_use]
    pub fn enumeration_with(name: &str, entries: Vec<EnumEntry>) -> Self {
        Self::with_constraint(name, Constraint::Enumeration { entries })
    }

    /// Raw feature.
    #[must_use]
    pub fn raw(name: &str, max_size: usize) -> Self {
        Self::with_constraint(name, Constraint::Raw { max_size })
    }

    /// Command feature.
    #[must_use]
    pub fn command(name: &str) -> Self {
        Self::with_constraint(name, Constraint::Command)
    }

    /// Initial value (also the value of every selector slot not yet written).
    #[must_use]
    pub fn with_value(mut self, value: impl Into<FeatureValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Set the display name.
    #[must_use]
    pub fn with_display_name(mut self, display_name: &str) -> Self {
        self.info.display_name = display_name.to_string();
        self
    }

    /// Set the tooltip.
    #[must_use]
    pub fn with_tooltip(mut self, tooltip: &str) -> Self {
        self.info.tooltip = tooltip.to_string();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.info.description = description.to_string();
        self
    }

    /// Set the unit.
    #[must_use]
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.info.unit = Some(unit.to_string());
        self
    }

    /// Set the increment of an Integer or Float feature.
    #[must_use]
    pub fn with_increment(mut self, step: impl Into<FeatureValue>) -> Self {
        match (&mut self.info.constraint, step.into()) {
            (Constraint::Integer { increment, .. }, FeatureValue::Integer(v)) if v > 0 => {
                *increment = Some(v);
            }
            (Constraint::Float { increment, .. }, FeatureValue::Float(v)) if v > 0.0 => {
                *increment = Some(v);
            }
            _ => {}
        }
        self
    }

    /// Mark as vendor specific.
    #[must_use]
    pub fn custom(mut self) -> Self {
        self.info.namespace = Namespace::Custom;
        self
    }

    /// Set the access mode.
    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.info.access = access;
        self
    }

    /// Shorthand for `with_access(Access::ReadOnly)`.
    #[must_use]
    pub fn read_only(self) -> Self {
        self.with_access(Access::ReadOnly)
    }

    /// Set the visibility.
    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.info.visibility = visibility;
        self
    }

    /// Flag this enumeration as a selector.
    #[must_use]
    pub fn as_selector(mut self) -> Self {
        self.info.is_selector = true;
        self
    }

    /// Store one value per entry of `selector`.
    #[must_use]
    pub fn selected_by(mut self, selector: &str) -> Self {
        self.info.selected_by = Some(selector.to_string());
        self
    }

    /// Add an availability rule. All rules must hold.
    #[must_use]
    pub fn available_when(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Bind a device-side handler.
    #[must_use]
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(HookAction<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Static description.
    #[must_use]
    pub fn info(&self) -> &FeatureInfo {
        &self.info
    }

    /// Feature name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.info.name
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feature")
            .field("info", &self.info)
            .field("default", &self.default)
            .field("conditions", &self.conditions)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

/// Read-side view shared by module containers and chunk data.
pub trait FeatureSource {
    /// Feature names in declaration order.
    fn feature_names(&self) -> Vec<String>;

    /// Static description of `name`.
    fn info(&self, name: &str) -> Result<FeatureInfo>;

    /// Current value of `name`.
    fn read(&self, name: &str) -> Result<FeatureValue>;

    /// Whether `name` is currently available.
    fn is_available(&self, name: &str) -> bool;

    /// Untyped display value for introspection.
    ///
    /// Unavailable features render as `<not available>`, unreadable ones as
    /// `<not accessible>`.
    fn display_value(&self, name: &str) -> String {
        if !self.is_available(name) {
            return "<not available>".to_string();
        }
        match self.read(name) {
            Ok(value) => value.to_string(),
            Err(crate::VmbError::NotAvailable(_)) => "<not available>".to_string(),
            Err(_) => "<not accessible>".to_string(),
        }
    }
}
