//! Parent-tracks-children ownership.
//!
//! Every open module handle owns a [`Scope`] (is it still open?) and a
//! [`Registry`] of the children opened beneath it. Children hold a clone of
//! their parent's scope and refuse to work once it is closed; the parent
//! tears its live children down, newest first, when it closes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use vmbx_core::{Result, VmbError};

/// Something a parent can force closed.
#[async_trait]
pub trait Teardown: Send + Sync {
    /// Name used in logs.
    fn label(&self) -> String;

    /// Release the resource and everything beneath it. Must be idempotent.
    async fn teardown(&self) -> Result<()>;
}

/// Open/closed flag shared between a handle and its children.
#[derive(Clone, Debug)]
pub struct Scope {
    label: Arc<str>,
    open: Arc<AtomicBool>,
}

impl Scope {
    /// A new, open scope.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Name of the owning handle.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the owner is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// `InvalidState` once the owner closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(VmbError::InvalidState(format!("{} is closed", self.label)))
        }
    }

    /// Mark closed. Returns `true` for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.open.swap(false, Ordering::SeqCst)
    }
}

/// Weak references to the children of one handle.
pub struct Registry {
    owner: String,
    children: Mutex<Vec<Weak<dyn Teardown>>>,
}

impl Registry {
    /// Empty registry of `owner`.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            children: Mutex::new(Vec::new()),
        }
    }

    /// Track `child`. Entries of children already dropped are pruned.
    pub fn register<T: Teardown + 'static>(&self, child: &Arc<T>) {
        let weak: Weak<dyn Teardown> = Arc::downgrade(child) as Weak<dyn Teardown>;
        let mut children = self.children.lock();
        children.retain(|c| c.strong_count() > 0);
        children.push(weak);
    }

    /// Children still alive.
    #[must_use]
    pub fn live(&self) -> usize {
        self.children
            .lock()
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Tear down every live child, newest first.
    ///
    /// Failures are logged and do not stop the remaining teardowns. Returns
    /// the number of children that failed.
    pub async fn teardown_all(&self) -> usize {
        let children: Vec<Weak<dyn Teardown>> = std::mem::take(&mut *self.children.lock());
        let mut failures = 0;
        for child in children.iter().rev() {
            let Some(child) = child.upgrade() else {
                continue;
            };
            let label = child.label();
            match child.teardown().await {
                Ok(()) => debug!(owner = %self.owner, child = %label, "Child closed"),
                Err(err) => {
                    failures += 1;
                    warn!(owner = %self.owner, child = %label, error = %err, "Teardown failed, continuing");
                }
            }
        }
        failures
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("owner", &self.owner)
            .field("live", &self.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    struct Child {
        name: &'static str,
        fail: bool,
        closed: AtomicUsize,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Teardown for Child {
        fn label(&self) -> String {
            self.name.to_string()
        }

        async fn teardown(&self) -> Result<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.order.lock().push(self.name);
            if self.fail {
                Err(VmbError::InvalidState("stuck".into()))
            } else {
                Ok(())
            }
        }
    }

    fn child(name: &'static str, fail: bool, order: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Child> {
        Arc::new(Child {
            name,
            fail,
            closed: AtomicUsize::new(0),
            order: Arc::clone(order),
        })
    }

    #[test]
    fn test_scope_close_once() {
        let scope = Scope::new("camera DEV_1");
        let view = scope.clone();
        assert!(view.ensure_open().is_ok());
        assert!(scope.close());
        assert!(!scope.close());
        assert!(matches!(view.ensure_open(), Err(VmbError::InvalidState(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_teardown_continues_after_failure() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new("system");
        let a = child("a", false, &order);
        let b = child("b", true, &order);
        let c = child("c", false, &order);
        registry.register(&a);
        registry.register(&b);
        registry.register(&c);

        assert_eq!(registry.teardown_all().await, 1);
        assert_eq!(*order.lock(), vec!["c", "b", "a"]);
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
        assert!(logs_contain("Teardown failed, continuing"));

        // Registry is empty afterwards.
        assert_eq!(registry.teardown_all().await, 0);
        assert_eq!(a.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_children_are_skipped() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = Registry::new("camera");
        let kept = child("kept", false, &order);
        {
            let gone = child("gone", false, &order);
            registry.register(&gone);
        }
        registry.register(&kept);
        assert_eq!(registry.live(), 1);
        registry.teardown_all().await;
        assert_eq!(*order.lock(), vec!["kept"]);
    }
}
