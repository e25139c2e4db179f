//! System handle: entry point, enumeration and camera access.
//!
//! ## Startup counting
//!
//! Several [`System`] handles may be alive at once (tests, embedding
//! applications). A process-wide counter tracks them:
//! - 0 → 1: the platform is considered started
//! - 1 → 0: the last handle shut down
//!
//! Each handle decrements the counter exactly once, on [`System::shutdown`] or
//! on drop, whichever comes first.

use crate::camera::Camera;
use crate::config::VmbxConfig;
use crate::lifecycle::{Registry, Scope};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vmbx_core::feature::FeatureContainer;
use vmbx_core::module::{ModuleDescriptor, ModuleKind};
use vmbx_core::platform::Transport;
use vmbx_core::{Result, VmbError};
use vmbx_sim::SimTransport;

static STARTUP_COUNT: AtomicU32 = AtomicU32::new(0);

/// Serializes increment + log and decrement + log.
static STARTUP_LOCK: Mutex<()> = parking_lot::const_mutex(());

fn acquire_startup() {
    let _guard = STARTUP_LOCK.lock();
    let prev = STARTUP_COUNT.fetch_add(1, Ordering::SeqCst);
    if prev == 0 {
        info!("Camera system started (ref count: 1)");
    } else {
        debug!("Camera system already started (ref count: {})", prev + 1);
    }
}

fn release_startup() {
    let _guard = STARTUP_LOCK.lock();
    let prev = STARTUP_COUNT.fetch_sub(1, Ordering::SeqCst);
    if prev == 1 {
        info!("Camera system shut down (last handle closed)");
    } else if prev == 0 {
        warn!("Startup count underflow, resetting to 0");
        STARTUP_COUNT.store(0, Ordering::SeqCst);
    } else {
        debug!("Camera system still in use (ref count: {})", prev - 1);
    }
}

struct SystemInner {
    transport: Arc<dyn Transport>,
    config: VmbxConfig,
    scope: Scope,
    cameras: Registry,
}

/// A started camera system.
///
/// Cameras opened through it are closed when it shuts down.
pub struct System {
    inner: Arc<SystemInner>,
}

impl System {
    /// Start on `transport` with the default configuration.
    pub fn startup(transport: Arc<dyn Transport>) -> Result<Self> {
        Self::startup_with(transport, VmbxConfig::default())
    }

    /// Start on `transport` with `config`.
    pub fn startup_with(transport: Arc<dyn Transport>, config: VmbxConfig) -> Result<Self> {
        config.validate()?;
        acquire_startup();
        Ok(Self {
            inner: Arc::new(SystemInner {
                transport,
                config,
                scope: Scope::new("system"),
                cameras: Registry::new("system"),
            }),
        })
    }

    /// Start on the simulated platform described by `config`.
    pub fn from_config(config: VmbxConfig) -> Result<Self> {
        let transport = SimTransport::new(config.simulation.cameras.clone());
        Self::startup_with(Arc::new(transport), config)
    }

    /// Live system handles in this process.
    #[must_use]
    pub fn startup_count() -> u32 {
        STARTUP_COUNT.load(Ordering::SeqCst)
    }

    /// Configuration the system runs with.
    #[must_use]
    pub fn config(&self) -> &VmbxConfig {
        &self.inner.config
    }

    /// Whether the system is still running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.scope.is_open()
    }

    fn list(&self, kind: ModuleKind) -> Result<Vec<ModuleDescriptor>> {
        self.inner.scope.ensure_open()?;
        self.inner.transport.list_modules(kind)
    }

    /// Cameras in enumeration order.
    pub fn get_cameras(&self) -> Result<Vec<ModuleDescriptor>> {
        self.list(ModuleKind::Camera)
    }

    /// Interfaces in enumeration order.
    pub fn interfaces(&self) -> Result<Vec<ModuleDescriptor>> {
        self.list(ModuleKind::Interface)
    }

    /// Transport layers in enumeration order.
    pub fn transport_layers(&self) -> Result<Vec<ModuleDescriptor>> {
        self.list(ModuleKind::TransportLayer)
    }

    /// Features of a transport layer or interface.
    pub fn module_features(&self, kind: ModuleKind, id: &str) -> Result<FeatureContainer> {
        self.inner.scope.ensure_open()?;
        self.inner.transport.module_features(kind, id)
    }

    /// Open the camera described by `descriptor`.
    pub async fn open(&self, descriptor: &ModuleDescriptor) -> Result<Camera> {
        if descriptor.kind != ModuleKind::Camera {
            return Err(VmbError::InvalidState(format!(
                "'{}' is a {} module, not a camera",
                descriptor.id, descriptor.kind
            )));
        }
        self.open_by_id(&descriptor.id).await
    }

    /// Open a camera by id. An unknown id fails with `NotFound` and leaves
    /// the system untouched.
    pub async fn open_by_id(&self, id: &str) -> Result<Camera> {
        self.inner.scope.ensure_open()?;
        let device = self.inner.transport.open_camera(id).await?;
        let camera = match Camera::new(
            Arc::clone(&device),
            self.inner.scope.clone(),
            self.inner.config.capture.clone(),
        ) {
            Ok(camera) => camera,
            Err(err) => {
                if let Err(close_err) = device.close().await {
                    warn!(camera_id = %id, error = %close_err, "Failed to release camera after open error");
                }
                return Err(err);
            }
        };
        self.inner.cameras.register(camera.inner());
        info!(camera_id = %id, "Camera opened");
        Ok(camera)
    }

    /// Close every open camera and release this handle.
    ///
    /// Returns the number of cameras whose teardown failed; the failures are
    /// logged and do not stop the remaining teardowns.
    pub async fn shutdown(self) -> usize {
        if !self.inner.scope.close() {
            return 0;
        }
        let failures = self.inner.cameras.teardown_all().await;
        release_startup();
        failures
    }
}

impl Drop for System {
    fn drop(&mut self) {
        if !self.inner.scope.close() {
            return;
        }
        release_startup();
        let inner = Arc::clone(&self.inner);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                inner.cameras.teardown_all().await;
            });
        }
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("open", &self.is_open())
            .field("cameras", &self.inner.cameras)
            .finish()
    }
}
