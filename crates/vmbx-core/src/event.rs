//! Device event notifications.
//!
//! The device reports events (acquisition start, exposure end, ...) on an
//! unbounded channel. An [`EventChannel`] routes each occurrence to a
//! per-category dispatch task, so one category is always delivered in
//! generation order while different categories proceed independently and
//! concurrently with frame delivery.
//!
//! Enabling follows the selector pattern: `EventSelector` picks a category
//! and `EventNotification` switches it `On` or `Off`. Every category is
//! switched off when the channel is created; subscribing switches on exactly
//! the category it names, and dropping the last [`Subscription`] of a
//! category switches it off again.

use crate::error::{Result, VmbError};
use crate::feature::FeatureContainer;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Selector feature choosing the event category.
pub const EVENT_SELECTOR: &str = "EventSelector";
/// Enable feature addressed by [`EVENT_SELECTOR`].
pub const EVENT_NOTIFICATION: &str = "EventNotification";

/// One event raised by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventOccurrence {
    /// Category, i.e. the `EventSelector` entry (`AcquisitionStart`).
    pub category: String,
    /// Name of the event's data feature (`EventAcquisitionStart`).
    pub feature: String,
    /// Device event id.
    pub event_id: u64,
    /// Device timestamp in nanoseconds.
    pub timestamp: u64,
    /// Per-category generation counter assigned by the device.
    pub sequence: u64,
}

impl EventOccurrence {
    /// Occurrence of `category`, with the feature name derived from it.
    pub fn new(category: &str, event_id: u64, timestamp: u64, sequence: u64) -> Self {
        Self {
            category: category.to_string(),
            feature: feature_for(category),
            event_id,
            timestamp,
            sequence,
        }
    }
}

/// Data feature name of an event category.
#[must_use]
pub fn feature_for(category: &str) -> String {
    format!("Event{}", category)
}

type EventCallback = Arc<dyn Fn(&EventOccurrence) + Send + Sync>;

struct Shared {
    features: FeatureContainer,
    runtime: Handle,
    subscribers: Mutex<HashMap<String, Vec<(u64, EventCallback)>>>,
    dispatchers: Mutex<HashMap<String, mpsc::UnboundedSender<EventOccurrence>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes selector + enable write pairs, and the subscriber list
    /// changes that trigger them.
    config_lock: Mutex<()>,
    next_id: AtomicU64,
    delivered: AtomicU64,
}

impl Shared {
    fn set_notification(&self, category: &str, on: bool) -> Result<()> {
        let _guard = self.config_lock.lock();
        self.write_notification(category, on)
    }

    /// Caller holds `config_lock`.
    fn write_notification(&self, category: &str, on: bool) -> Result<()> {
        self.features.write_entry(EVENT_SELECTOR, category)?;
        self.features
            .write_entry(EVENT_NOTIFICATION, if on { "On" } else { "Off" })
    }

    fn dispatcher_for(self: &Arc<Self>, category: &str) {
        let mut dispatchers = self.dispatchers.lock();
        if dispatchers.contains_key(category) {
            return;
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<EventOccurrence>();
        let shared = Arc::downgrade(self);
        let name = category.to_string();
        let task = self.runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let callbacks: Vec<EventCallback> = shared
                    .subscribers
                    .lock()
                    .get(&name)
                    .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default();
                for callback in callbacks {
                    if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                        warn!(category = %name, sequence = event.sequence, "Event callback panicked");
                    }
                }
                shared.delivered.fetch_add(1, Ordering::Relaxed);
            }
            trace!(category = %name, "Event dispatcher finished");
        });
        dispatchers.insert(category.to_string(), tx);
        self.tasks.lock().push(task);
    }
}

/// Routes device events to subscribers, one ordered path per category.
pub struct EventChannel {
    shared: Arc<Shared>,
}

impl EventChannel {
    /// Create the channel and switch every event category off.
    ///
    /// Must be called from within a tokio runtime. A device without an
    /// `EventSelector` still gets a channel; subscribing on it fails with
    /// `NotImplemented`.
    pub fn new(
        features: FeatureContainer,
        mut events: mpsc::UnboundedReceiver<EventOccurrence>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| VmbError::InvalidState("event channel needs a tokio runtime".into()))?;
        let shared = Arc::new(Shared {
            features,
            runtime,
            subscribers: Mutex::new(HashMap::new()),
            dispatchers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            config_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        });

        let channel = Self { shared };
        if channel.shared.features.contains(EVENT_SELECTOR) {
            channel.disable_all()?;
        }

        let weak = Arc::downgrade(&channel.shared);
        let router = channel.shared.runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let tx = shared.dispatchers.lock().get(&event.category).cloned();
                match tx {
                    Some(tx) => {
                        let _ = tx.send(event);
                    }
                    None => trace!(category = %event.category, "No subscriber for event"),
                }
            }
        });
        channel.shared.tasks.lock().push(router);
        Ok(channel)
    }

    /// Event categories the device offers.
    pub fn categories(&self) -> Result<Vec<String>> {
        if !self.shared.features.contains(EVENT_SELECTOR) {
            return Err(VmbError::NotImplemented(EVENT_SELECTOR.into()));
        }
        self.shared.features.list_entries(EVENT_SELECTOR)
    }

    /// Switch every category off. Returns the number of categories touched.
    pub fn disable_all(&self) -> Result<usize> {
        let categories = self.categories()?;
        for category in &categories {
            self.shared.set_notification(category, false)?;
        }
        debug!(count = categories.len(), "All event notifications disabled");
        Ok(categories.len())
    }

    /// Subscribe to an event by its data feature name (`EventAcquisitionStart`).
    ///
    /// The callback runs on the category's dispatch task, once per
    /// occurrence. A callback that blocks stalls later occurrences of the
    /// same category only.
    pub fn subscribe<F>(&self, feature_name: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&EventOccurrence) + Send + Sync + 'static,
    {
        let features = &self.shared.features;
        if !features.contains(EVENT_SELECTOR) {
            return Err(VmbError::NotImplemented(format!(
                "device has no {} for '{}'",
                EVENT_SELECTOR, feature_name
            )));
        }
        if !features.contains(feature_name) {
            return Err(VmbError::NotFound(format!("event feature '{}'", feature_name)));
        }
        let category = feature_name
            .strip_prefix("Event")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| VmbError::NotFound(format!("'{}' is not an event feature", feature_name)))?;
        if !features.list_entries(EVENT_SELECTOR)?.iter().any(|e| e == category) {
            return Err(VmbError::NotImplemented(format!("event category '{}'", category)));
        }

        self.shared.dispatcher_for(category);

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let _config = self.shared.config_lock.lock();
        let first = {
            let mut subscribers = self.shared.subscribers.lock();
            let list = subscribers.entry(category.to_string()).or_default();
            list.push((id, Arc::new(callback)));
            list.len() == 1
        };
        if first {
            if let Err(err) = self.shared.write_notification(category, true) {
                if let Some(list) = self.shared.subscribers.lock().get_mut(category) {
                    list.retain(|(sid, _)| *sid != id);
                }
                return Err(err);
            }
            info!(category, "Event notification enabled");
        }

        Ok(Subscription {
            shared: Arc::downgrade(&self.shared),
            category: category.to_string(),
            id,
        })
    }

    /// Release a subscription. Same as dropping it.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Live subscriptions for a category.
    #[must_use]
    pub fn subscriber_count(&self, category: &str) -> usize {
        self.shared
            .subscribers
            .lock()
            .get(category)
            .map_or(0, Vec::len)
    }

    /// Occurrences dispatched so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Stop routing and dispatching.
    pub fn close(&self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.dispatchers.lock().clear();
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// A registered event callback. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    shared: Weak<Shared>,
    category: String,
    id: u64,
}

impl Subscription {
    /// Category this subscription listens to.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Unsubscribe now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let _config = shared.config_lock.lock();
        let last = {
            let mut subscribers = shared.subscribers.lock();
            match subscribers.get_mut(&self.category) {
                Some(list) => {
                    list.retain(|(id, _)| *id != self.id);
                    list.is_empty()
                }
                None => false,
            }
        };
        if last {
            match shared.write_notification(&self.category, false) {
                Ok(()) => debug!(category = %self.category, "Event notification disabled"),
                Err(err) => warn!(category = %self.category, error = %err, "Failed to disable event notification"),
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("category", &self.category)
            .field("id", &self.id)
            .finish()
    }
}
