use super::{
    Access, Constraint, EnumEntry, Feature, FeatureInfo, FeatureSource, FeatureType,
    FeatureValue, HookAction,
};
use crate::error::{Result, VmbError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

type ChangeCallback = Arc<dyn Fn(&str, &FeatureValue) + Send + Sync>;

/// Key of the value slot used by features that no selector addresses.
const UNSELECTED: &str = "";

struct Entry {
    feature: Feature,
    slots: HashMap<String, FeatureValue>,
    available: bool,
    command_done: bool,
}

struct Inner {
    scope: String,
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl Inner {
    fn lookup(&self, name: &str) -> Result<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| VmbError::NotFound(format!("feature '{}' in {}", name, self.scope)))
    }

    fn slot_key(&self, idx: usize) -> String {
        let Some(selector) = &self.entries[idx].feature.info.selected_by else {
            return UNSELECTED.to_string();
        };
        match self.index.get(selector.as_str()) {
            Some(&sel_idx) if sel_idx != idx => self
                .value_at(sel_idx)
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            _ => UNSELECTED.to_string(),
        }
    }

    fn value_at(&self, idx: usize) -> Option<FeatureValue> {
        let key = self.slot_key(idx);
        let entry = &self.entries[idx];
        entry
            .slots
            .get(&key)
            .cloned()
            .or_else(|| entry.feature.default.clone())
    }

    fn value_of(&self, name: &str) -> Option<FeatureValue> {
        self.index.get(name).and_then(|&idx| self.value_at(idx))
    }

    fn is_referenced(&self, name: &str) -> bool {
        self.entries.iter().any(|e| {
            e.feature.conditions.iter().any(|c| c.feature == name)
                || e.feature.info.selected_by.as_deref() == Some(name)
        })
    }

    fn refresh(&mut self) {
        let availability: Vec<bool> = self
            .entries
            .iter()
            .map(|e| {
                e.feature.conditions.iter().all(|c| match self.value_of(&c.feature) {
                    Some(v) => (v == c.value) != c.negate,
                    None => false,
                })
            })
            .collect();
        for (entry, available) in self.entries.iter_mut().zip(availability) {
            entry.available = available;
        }
    }

    fn readable(&self, idx: usize) -> Result<FeatureValue> {
        let entry = &self.entries[idx];
        let info = &entry.feature.info;
        if !entry.available {
            return Err(VmbError::NotAvailable(format!("feature '{}'", info.name)));
        }
        if info.feature_type == FeatureType::Command || !info.access.readable() {
            return Err(VmbError::InvalidAccess(format!(
                "feature '{}' is not readable",
                info.name
            )));
        }
        self.value_at(idx)
            .ok_or_else(|| VmbError::NotAvailable(format!("feature '{}' has no value", info.name)))
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: Vec<(u64, String, ChangeCallback)>,
}

/// Ordered, name-keyed set of features belonging to one module.
///
/// Cloning is cheap and every clone shares the same state. The container can
/// be read and written from the application and from delivery callbacks at
/// the same time; writes to one feature from two paths are not ordered here.
#[derive(Clone)]
pub struct FeatureContainer {
    inner: Arc<RwLock<Inner>>,
    listeners: Arc<Mutex<Listeners>>,
}

/// Non-owning reference to a [`FeatureContainer`], for use inside hooks.
#[derive(Clone)]
pub struct WeakFeatureContainer {
    inner: Weak<RwLock<Inner>>,
    listeners: Weak<Mutex<Listeners>>,
}

impl WeakFeatureContainer {
    /// Get the container back if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<FeatureContainer> {
        Some(FeatureContainer {
            inner: self.inner.upgrade()?,
            listeners: self.listeners.upgrade()?,
        })
    }
}

impl FeatureContainer {
    /// Create an empty container. `scope` names the owning module in errors and logs.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                scope: scope.into(),
                entries: Vec::new(),
                index: HashMap::new(),
            })),
            listeners: Arc::new(Mutex::new(Listeners::default())),
        }
    }

    /// Non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakFeatureContainer {
        WeakFeatureContainer {
            inner: Arc::downgrade(&self.inner),
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Name of the owning module.
    #[must_use]
    pub fn scope(&self) -> String {
        self.inner.read().scope.clone()
    }

    /// Add a feature, replacing any feature with the same name.
    ///
    /// Enumerations without an explicit value start on their first entry.
    pub fn insert(&self, mut feature: Feature) {
        if feature.default.is_none() {
            if let Constraint::Enumeration { entries } = &feature.info.constraint {
                feature.default = entries.first().map(|e| FeatureValue::entry(e.name.clone()));
            }
        }

        let mut inner = self.inner.write();
        let entry = Entry {
            feature,
            slots: HashMap::new(),
            available: true,
            command_done: true,
        };
        let name = entry.feature.info.name.clone();
        match inner.index.get(&name) {
            Some(&idx) => inner.entries[idx] = entry,
            None => {
                let idx = inner.entries.len();
                inner.entries.push(entry);
                inner.index.insert(name, idx);
            }
        }
        inner.refresh();
    }

    /// Number of features.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True when the container holds no features.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a feature with this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().index.contains_key(name)
    }

    /// Look up a feature's description.
    pub fn get(&self, name: &str) -> Result<FeatureInfo> {
        let inner = self.inner.read();
        let idx = inner.lookup(name)?;
        Ok(inner.entries[idx].feature.info.clone())
    }

    /// Descriptions of every feature, in declaration order.
    #[must_use]
    pub fn infos(&self) -> Vec<FeatureInfo> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| e.feature.info.clone())
            .collect()
    }

    /// Read a feature's current value.
    pub fn read(&self, name: &str) -> Result<FeatureValue> {
        let inner = self.inner.read();
        let idx = inner.lookup(name)?;
        inner.readable(idx)
    }

    /// Read the slot of a selected feature for `selector_entry` without
    /// moving the selector.
    pub fn read_selected(&self, name: &str, selector_entry: &str) -> Result<FeatureValue> {
        let inner = self.inner.read();
        let idx = inner.lookup(name)?;
        let entry = &inner.entries[idx];
        if entry.feature.info.selected_by.is_none() {
            return Err(VmbError::InvalidAccess(format!(
                "feature '{}' has no selector",
                name
            )));
        }
        inner.readable(idx)?;
        entry
            .slots
            .get(selector_entry)
            .cloned()
            .or_else(|| entry.feature.default.clone())
            .ok_or_else(|| VmbError::NotAvailable(format!("feature '{}' has no value", name)))
    }

    fn read_typed<T>(
        &self,
        name: &str,
        expected: FeatureType,
        extract: impl FnOnce(FeatureValue) -> Option<T>,
    ) -> Result<T> {
        let value = self.read(name)?;
        let found = value.feature_type();
        extract(value).ok_or_else(|| VmbError::TypeMismatch {
            feature: name.to_string(),
            expected,
            found,
        })
    }

    /// Read an Integer feature.
    pub fn read_int(&self, name: &str) -> Result<i64> {
        self.read_typed(name, FeatureType::Integer, |v| v.as_i64())
    }

    /// Read a Float feature.
    pub fn read_float(&self, name: &str) -> Result<f64> {
        self.read_typed(name, FeatureType::Float, |v| v.as_f64())
    }

    /// Read a Boolean feature.
    pub fn read_bool(&self, name: &str) -> Result<bool> {
        self.read_typed(name, FeatureType::Boolean, |v| v.as_bool())
    }

    /// Read a String feature.
    pub fn read_string(&self, name: &str) -> Result<String> {
        self.read_typed(name, FeatureType::String, |v| match v {
            FeatureValue::String(s) => Some(s),
            _ => None,
        })
    }

    /// Read the selected entry of an Enumeration feature.
    pub fn read_enum(&self, name: &str) -> Result<String> {
        self.read_typed(name, FeatureType::Enumeration, |v| match v {
            FeatureValue::Enumeration(s) => Some(s),
            _ => None,
        })
    }

    /// Read a Raw feature.
    pub fn read_raw(&self, name: &str) -> Result<Vec<u8>> {
        self.read_typed(name, FeatureType::Raw, |v| match v {
            FeatureValue::Raw(b) => Some(b),
            _ => None,
        })
    }

    /// Write a value.
    ///
    /// Fails with `NotFound`, `NotAvailable`, `InvalidAccess`, `TypeMismatch`
    /// or `OutOfRange` before anything changes. A bound hook then runs; its
    /// error is returned and the stored value stays as it was.
    pub fn write(&self, name: &str, value: impl Into<FeatureValue>) -> Result<()> {
        let value = value.into();
        let (hook, key) = {
            let inner = self.inner.read();
            let idx = inner.lookup(name)?;
            let entry = &inner.entries[idx];
            let info = &entry.feature.info;
            if !entry.available {
                return Err(VmbError::NotAvailable(format!("feature '{}'", name)));
            }
            if !info.access.writable() {
                return Err(VmbError::InvalidAccess(format!(
                    "feature '{}' is read-only",
                    name
                )));
            }
            validate(info, &value)?;
            (entry.feature.hook.clone(), inner.slot_key(idx))
        };

        if let Some(hook) = hook {
            hook(HookAction::Write(&value))?;
        }

        self.store(name, &key, value.clone())?;
        debug!(feature = name, value = %value, "Feature written");
        self.notify(name, &value);
        Ok(())
    }

    /// Write an enumeration entry by name.
    pub fn write_entry(&self, name: &str, entry: &str) -> Result<()> {
        self.write(name, FeatureValue::entry(entry))
    }

    fn store(&self, name: &str, key: &str, value: FeatureValue) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner.lookup(name)?;
        inner.entries[idx].slots.insert(key.to_string(), value);
        if inner.entries[idx].feature.info.is_selector || inner.is_referenced(name) {
            inner.refresh();
            trace!(scope = %inner.scope, selector = name, "Availability re-evaluated");
        }
        Ok(())
    }

    /// Names of the currently valid entries of an enumeration, in order.
    pub fn list_entries(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .entries(name)?
            .into_iter()
            .filter(|e| e.available)
            .map(|e| e.name)
            .collect())
    }

    /// Every entry of an enumeration, valid or not.
    pub fn entries(&self, name: &str) -> Result<Vec<EnumEntry>> {
        let inner = self.inner.read();
        let idx = inner.lookup(name)?;
        match &inner.entries[idx].feature.info.constraint {
            Constraint::Enumeration { entries } => Ok(entries.clone()),
            other => Err(VmbError::TypeMismatch {
                feature: name.to_string(),
                expected: FeatureType::Enumeration,
                found: other.feature_type(),
            }),
        }
    }

    /// Numeric code of an enumeration entry.
    pub fn entry_code(&self, name: &str, entry: &str) -> Result<i64> {
        self.entries(name)?
            .into_iter()
            .find(|e| e.name == entry)
            .map(|e| e.code)
            .ok_or_else(|| VmbError::NotFound(format!("entry '{}' of '{}'", entry, name)))
    }

    /// Execute a command feature.
    ///
    /// A command without a bound handler fails with `NotImplemented`.
    pub fn run_command(&self, name: &str) -> Result<()> {
        let hook = {
            let mut inner = self.inner.write();
            let idx = inner.lookup(name)?;
            let entry = &mut inner.entries[idx];
            if entry.feature.info.feature_type != FeatureType::Command {
                return Err(VmbError::TypeMismatch {
                    feature: name.to_string(),
                    expected: FeatureType::Command,
                    found: entry.feature.info.feature_type,
                });
            }
            if !entry.available {
                return Err(VmbError::NotAvailable(format!("command '{}'", name)));
            }
            let Some(hook) = entry.feature.hook.clone() else {
                return Err(VmbError::NotImplemented(format!("command '{}'", name)));
            };
            entry.command_done = true;
            hook
        };
        debug!(command = name, "Running command");
        hook(HookAction::Run)
    }

    /// Whether the last run of a command has finished.
    pub fn is_command_done(&self, name: &str) -> Result<bool> {
        let inner = self.inner.read();
        let idx = inner.lookup(name)?;
        let entry = &inner.entries[idx];
        if entry.feature.info.feature_type != FeatureType::Command {
            return Err(VmbError::TypeMismatch {
                feature: name.to_string(),
                expected: FeatureType::Command,
                found: entry.feature.info.feature_type,
            });
        }
        Ok(entry.command_done)
    }

    /// Device side: mark a command as still running or finished.
    ///
    /// Handlers that complete asynchronously call this with `false` while
    /// running and `true` once done.
    pub fn set_command_done(&self, name: &str, done: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner.lookup(name)?;
        inner.entries[idx].command_done = done;
        Ok(())
    }

    /// Device side: store a value without access checks or hooks.
    ///
    /// The type must still match. Selected features take the value in the
    /// slot of the selector's current entry. Change listeners are notified.
    pub fn set_device_value(&self, name: &str, value: impl Into<FeatureValue>) -> Result<()> {
        let value = value.into();
        let key = {
            let inner = self.inner.read();
            let idx = inner.lookup(name)?;
            let expected = inner.entries[idx].feature.info.feature_type;
            if expected != value.feature_type() {
                return Err(VmbError::TypeMismatch {
                    feature: name.to_string(),
                    expected,
                    found: value.feature_type(),
                });
            }
            inner.slot_key(idx)
        };
        self.store(name, &key, value.clone())?;
        self.notify(name, &value);
        Ok(())
    }

    /// Device side: change the access mode (e.g. lock a feature while streaming).
    pub fn set_access(&self, name: &str, access: Access) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner.lookup(name)?;
        inner.entries[idx].feature.info.access = access;
        Ok(())
    }

    /// Device side: replace the constraint of a feature, keeping its type.
    ///
    /// Increments must be positive.
    pub fn set_constraint(&self, name: &str, constraint: Constraint) -> Result<()> {
        let bad_increment = match &constraint {
            Constraint::Integer {
                increment: Some(step),
                ..
            } if *step <= 0 => Some(step.to_string()),
            Constraint::Float {
                increment: Some(step),
                ..
            } if !step.is_finite() || *step <= 0.0 => Some(step.to_string()),
            _ => None,
        };
        if let Some(step) = bad_increment {
            return Err(VmbError::OutOfRange {
                feature: name.to_string(),
                value: format!("increment {}", step),
                min: "1".into(),
                max: "unbounded".into(),
            });
        }
        let mut inner = self.inner.write();
        let idx = inner.lookup(name)?;
        let info = &mut inner.entries[idx].feature.info;
        if info.feature_type != constraint.feature_type() {
            return Err(VmbError::TypeMismatch {
                feature: name.to_string(),
                expected: info.feature_type,
                found: constraint.feature_type(),
            });
        }
        info.constraint = constraint;
        Ok(())
    }

    /// Device side: mark an enumeration entry valid or invalid.
    pub fn set_entry_available(&self, name: &str, entry: &str, available: bool) -> Result<()> {
        let mut inner = self.inner.write();
        let idx = inner.lookup(name)?;
        match &mut inner.entries[idx].feature.info.constraint {
            Constraint::Enumeration { entries } => {
                let e = entries
                    .iter_mut()
                    .find(|e| e.name == entry)
                    .ok_or_else(|| VmbError::NotFound(format!("entry '{}' of '{}'", entry, name)))?;
                e.available = available;
                Ok(())
            }
            other => Err(VmbError::TypeMismatch {
                feature: name.to_string(),
                expected: FeatureType::Enumeration,
                found: other.feature_type(),
            }),
        }
    }

    /// Register a callback run after every change of `name`.
    ///
    /// The callback runs on whichever path made the change, without locks held.
    pub fn on_change<F>(&self, name: &str, callback: F) -> Result<ChangeSubscription>
    where
        F: Fn(&str, &FeatureValue) + Send + Sync + 'static,
    {
        self.inner.read().lookup(name)?;
        let mut listeners = self.listeners.lock();
        listeners.next_id += 1;
        let id = listeners.next_id;
        listeners
            .callbacks
            .push((id, name.to_string(), Arc::new(callback)));
        Ok(ChangeSubscription {
            listeners: Arc::downgrade(&self.listeners),
            id,
        })
    }

    fn notify(&self, name: &str, value: &FeatureValue) {
        let callbacks: Vec<ChangeCallback> = self
            .listeners
            .lock()
            .callbacks
            .iter()
            .filter(|(_, feature, _)| feature == name)
            .map(|(_, _, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(name, value);
        }
    }
}

impl FeatureSource for FeatureContainer {
    fn feature_names(&self) -> Vec<String> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|e| e.feature.info.name.clone())
            .collect()
    }

    fn info(&self, name: &str) -> Result<FeatureInfo> {
        self.get(name)
    }

    fn read(&self, name: &str) -> Result<FeatureValue> {
        FeatureContainer::read(self, name)
    }

    fn is_available(&self, name: &str) -> bool {
        let inner = self.inner.read();
        inner
            .index
            .get(name)
            .is_some_and(|&idx| inner.entries[idx].available)
    }
}

impl std::fmt::Debug for FeatureContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("FeatureContainer")
            .field("scope", &inner.scope)
            .field("features", &inner.entries.len())
            .finish()
    }
}

/// Registration returned by [`FeatureContainer::on_change`].
///
/// Dropping it unregisters the callback.
#[must_use = "dropping the subscription unregisters the callback"]
pub struct ChangeSubscription {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl ChangeSubscription {
    /// Unregister now.
    pub fn unsubscribe(self) {}
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().callbacks.retain(|(id, _, _)| *id != self.id);
        }
    }
}

fn out_of_range(info: &FeatureInfo, value: String, min: String, max: String) -> VmbError {
    VmbError::OutOfRange {
        feature: info.name.clone(),
        value,
        min,
        max,
    }
}

fn validate(info: &FeatureInfo, value: &FeatureValue) -> Result<()> {
    match (&info.constraint, value) {
        (Constraint::Integer { min, max, increment }, FeatureValue::Integer(v)) => {
            if v < min || v > max {
                return Err(out_of_range(info, v.to_string(), min.to_string(), max.to_string()));
            }
            if let Some(step) = increment.filter(|step| *step > 0) {
                // Widened so that ranges spanning most of i64 cannot overflow.
                if (i128::from(*v) - i128::from(*min)) % i128::from(step) != 0 {
                    return Err(out_of_range(
                        info,
                        format!("{} (increment {})", v, step),
                        min.to_string(),
                        max.to_string(),
                    ));
                }
            }
            Ok(())
        }
        (Constraint::Float { min, max, .. }, FeatureValue::Float(v)) => {
            if !v.is_finite() || v < min || v > max {
                return Err(out_of_range(info, v.to_string(), min.to_string(), max.to_string()));
            }
            Ok(())
        }
        (Constraint::Boolean, FeatureValue::Boolean(_)) => Ok(()),
        (Constraint::String { max_length }, FeatureValue::String(s)) => {
            if s.len() > *max_length {
                return Err(out_of_range(
                    info,
                    format!("length {}", s.len()),
                    "0".into(),
                    max_length.to_string(),
                ));
            }
            Ok(())
        }
        (Constraint::Enumeration { entries }, FeatureValue::Enumeration(name)) => {
            match entries.iter().find(|e| &e.name == name) {
                None => Err(VmbError::NotFound(format!(
                    "entry '{}' of '{}'",
                    name, info.name
                ))),
                Some(e) if !e.available => Err(VmbError::NotAvailable(format!(
                    "entry '{}' of '{}'",
                    name, info.name
                ))),
                Some(_) => Ok(()),
            }
        }
        (Constraint::Raw { max_size }, FeatureValue::Raw(bytes)) => {
            if bytes.len() > *max_size {
                return Err(out_of_range(
                    info,
                    format!("{} bytes", bytes.len()),
                    "0".into(),
                    max_size.to_string(),
                ));
            }
            Ok(())
        }
        (constraint, value) => Err(VmbError::TypeMismatch {
            feature: info.name.clone(),
            expected: constraint.feature_type(),
            found: value.feature_type(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Condition;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn camera() -> FeatureContainer {
        let features = FeatureContainer::new("test/camera");
        features.insert(
            Feature::integer("Width", 8, 4128)
                .with_increment(8)
                .with_value(4128i64),
        );
        features.insert(Feature::float("ExposureTime", 10.0, 1.0e6).with_value(5000.0));
        features.insert(Feature::boolean("AcquisitionFrameRateEnable").with_value(false));
        features.insert(
            Feature::float("AcquisitionFrameRate", 0.1, 30.0)
                .with_value(5.0)
                .available_when(Condition::equals("AcquisitionFrameRateEnable", true)),
        );
        features.insert(Feature::string("DeviceUserID", 8).with_value("cam"));
        features.insert(Feature::string("DeviceModelName", 64).with_value("1800 U-1240m").read_only());
        features.insert(Feature::raw("UserData", 4).with_value(vec![0u8; 4]));
        features.insert(
            Feature::enumeration("EventSelector", &["AcquisitionStart", "AcquisitionEnd"])
                .as_selector(),
        );
        features.insert(
            Feature::enumeration("EventNotification", &["Off", "On"]).selected_by("EventSelector"),
        );
        features
    }

    #[test]
    fn test_write_then_read_within_range() {
        let f = camera();
        f.write("Width", 2064i64).unwrap();
        assert_eq!(f.read_int("Width").unwrap(), 2064);
        f.write("ExposureTime", 12_000.5).unwrap();
        assert_eq!(f.read_float("ExposureTime").unwrap(), 12_000.5);
        f.write("UserData", vec![1u8, 2]).unwrap();
        assert_eq!(f.read_raw("UserData").unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_out_of_range_leaves_value() {
        let f = camera();
        assert!(matches!(
            f.write("Width", 5000i64),
            Err(VmbError::OutOfRange { .. })
        ));
        assert!(matches!(
            f.write("Width", 100i64),
            Err(VmbError::OutOfRange { .. })
        ));
        assert!(matches!(
            f.write("ExposureTime", f64::NAN),
            Err(VmbError::OutOfRange { .. })
        ));
        assert!(matches!(
            f.write("DeviceUserID", "far too long"),
            Err(VmbError::OutOfRange { .. })
        ));
        assert!(matches!(
            f.write("UserData", vec![0u8; 5]),
            Err(VmbError::OutOfRange { .. })
        ));
        assert_eq!(f.read_int("Width").unwrap(), 4128);
    }

    #[test]
    fn test_type_mismatch() {
        let f = camera();
        assert_eq!(
            f.write("Width", 1.5),
            Err(VmbError::TypeMismatch {
                feature: "Width".into(),
                expected: FeatureType::Integer,
                found: FeatureType::Float,
            })
        );
        assert!(matches!(
            f.read_float("Width"),
            Err(VmbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_feature() {
        let f = camera();
        assert!(matches!(f.get("Nope"), Err(VmbError::NotFound(_))));
        assert!(matches!(f.read("Nope"), Err(VmbError::NotFound(_))));
        assert!(matches!(f.write("Nope", 1i64), Err(VmbError::NotFound(_))));
    }

    #[test]
    fn test_read_only_rejects_write() {
        let f = camera();
        assert!(matches!(
            f.write("DeviceModelName", "x"),
            Err(VmbError::InvalidAccess(_))
        ));
    }

    #[test]
    fn test_enum_membership() {
        let f = camera();
        f.write_entry("EventSelector", "AcquisitionEnd").unwrap();
        assert_eq!(f.read_enum("EventSelector").unwrap(), "AcquisitionEnd");
        assert!(matches!(
            f.write_entry("EventSelector", "FrameTrigger"),
            Err(VmbError::NotFound(_))
        ));

        f.set_entry_available("EventSelector", "AcquisitionStart", false)
            .unwrap();
        assert!(matches!(
            f.write_entry("EventSelector", "AcquisitionStart"),
            Err(VmbError::NotAvailable(_))
        ));
        assert_eq!(f.list_entries("EventSelector").unwrap(), vec!["AcquisitionEnd"]);
        assert_eq!(f.entry_code("EventSelector", "AcquisitionEnd").unwrap(), 1);
    }

    #[test]
    fn test_list_entries_rejects_non_enum() {
        let f = camera();
        assert!(matches!(
            f.list_entries("Width"),
            Err(VmbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_selector_addresses_slots() {
        let f = camera();
        f.write_entry("EventSelector", "AcquisitionStart").unwrap();
        f.write_entry("EventNotification", "On").unwrap();
        f.write_entry("EventSelector", "AcquisitionEnd").unwrap();
        assert_eq!(f.read_enum("EventNotification").unwrap(), "Off");
        assert_eq!(
            f.read_selected("EventNotification", "AcquisitionStart").unwrap(),
            FeatureValue::entry("On")
        );
        assert_eq!(f.read_enum("EventSelector").unwrap(), "AcquisitionEnd");
        f.write_entry("EventSelector", "AcquisitionStart").unwrap();
        assert_eq!(f.read_enum("EventNotification").unwrap(), "On");
    }

    #[test]
    fn test_availability_follows_condition() {
        let f = camera();
        assert!(!f.is_available("AcquisitionFrameRate"));
        assert!(matches!(
            f.read("AcquisitionFrameRate"),
            Err(VmbError::NotAvailable(_))
        ));
        assert!(matches!(
            f.write("AcquisitionFrameRate", 10.0),
            Err(VmbError::NotAvailable(_))
        ));
        assert_eq!(f.display_value("AcquisitionFrameRate"), "<not available>");

        f.write("AcquisitionFrameRateEnable", true).unwrap();
        f.write("AcquisitionFrameRate", 10.0).unwrap();
        assert_eq!(f.read_float("AcquisitionFrameRate").unwrap(), 10.0);
    }

    #[test]
    fn test_hook_failure_keeps_value() {
        let f = camera();
        f.insert(
            Feature::integer("Gain", 0, 48)
                .with_value(0i64)
                .with_hook(|action| match action {
                    HookAction::Write(FeatureValue::Integer(v)) if *v > 40 => Err(
                        VmbError::device("test", crate::DeviceFaultKind::Hardware, "gain stage"),
                    ),
                    _ => Ok(()),
                }),
        );
        f.write("Gain", 12i64).unwrap();
        assert!(matches!(f.write("Gain", 45i64), Err(VmbError::Device(_))));
        assert_eq!(f.read_int("Gain").unwrap(), 12);
    }

    #[test]
    fn test_commands() {
        let f = camera();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        f.insert(Feature::command("TriggerSoftware").with_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));
        f.insert(Feature::command("DeviceReset"));

        f.run_command("TriggerSoftware").unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(f.is_command_done("TriggerSoftware").unwrap());
        assert!(matches!(
            f.run_command("DeviceReset"),
            Err(VmbError::NotImplemented(_))
        ));
        assert!(matches!(
            f.run_command("Width"),
            Err(VmbError::TypeMismatch { .. })
        ));
        assert!(matches!(
            f.read("TriggerSoftware"),
            Err(VmbError::InvalidAccess(_))
        ));
        assert!(matches!(
            f.write("TriggerSoftware", true),
            Err(VmbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_change_listener_and_unsubscribe() {
        let f = camera();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = f
            .on_change("Width", move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        f.write("Width", 64i64).unwrap();
        f.set_device_value("Width", 128i64).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        drop(sub);
        f.write("Width", 256i64).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_device_value_bypasses_access() {
        let f = camera();
        f.set_device_value("DeviceModelName", "other").unwrap();
        assert_eq!(f.read_string("DeviceModelName").unwrap(), "other");
        assert!(matches!(
            f.set_device_value("DeviceModelName", 3i64),
            Err(VmbError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_lock_while_streaming() {
        let f = camera();
        f.set_access("Width", Access::ReadOnly).unwrap();
        assert!(matches!(
            f.write("Width", 64i64),
            Err(VmbError::InvalidAccess(_))
        ));
        f.set_access("Width", Access::ReadWrite).unwrap();
        f.write("Width", 64i64).unwrap();
    }

    #[test]
    fn test_names_keep_declaration_order() {
        let f = camera();
        let names = f.feature_names();
        assert_eq!(names[0], "Width");
        assert_eq!(names[1], "ExposureTime");
        assert_eq!(names.len(), f.len());
    }

    #[test]
    fn test_display_value_for_write_only() {
        let f = camera();
        f.insert(Feature::integer("Secret", 0, 10).with_value(1i64).with_access(Access::WriteOnly));
        assert_eq!(f.display_value("Secret"), "<not accessible>");
        assert_eq!(f.display_value("Width"), "4128");
    }

    #[test]
    fn test_weak_container() {
        let f = camera();
        let weak = f.downgrade();
        assert!(weak.upgrade().is_some());
        drop(f);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_increment_check_spans_full_range() {
        let f = FeatureContainer::new("test/wide");
        f.insert(Feature::integer("Offset", i64::MIN, i64::MAX).with_increment(2i64).with_value(0i64));
        f.write("Offset", i64::MAX - 1).unwrap();
        assert!(matches!(
            f.write("Offset", i64::MAX),
            Err(VmbError::OutOfRange { .. })
        ));
        assert_eq!(f.read_int("Offset").unwrap(), i64::MAX - 1);
    }

    #[test]
    fn test_constraint_rejects_non_positive_increment() {
        let f = camera();
        for step in [0, -8] {
            assert!(matches!(
                f.set_constraint(
                    "Width",
                    Constraint::Integer {
                        min: 8,
                        max: 64,
                        increment: Some(step),
                    },
                ),
                Err(VmbError::OutOfRange { .. })
            ));
        }
        assert!(f
            .set_constraint(
                "ExposureTime",
                Constraint::Float {
                    min: 10.0,
                    max: 100.0,
                    increment: Some(0.0),
                },
            )
            .is_err());
        // The old limits still apply.
        f.write("Width", 2064i64).unwrap();
    }
}
