//! Simulated transport layer: enumeration and camera access.

use crate::camera::SimCamera;
use crate::errors::ErrorConfig;
use crate::features;
use crate::SimCameraConfig;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use vmbx_core::feature::FeatureContainer;
use vmbx_core::module::{InterfaceKind, ModuleDescriptor, ModuleKind};
use vmbx_core::platform::{CameraDevice, Transport};
use vmbx_core::{Result, VmbError};

/// Id of the single simulated transport layer.
pub const TRANSPORT_LAYER_ID: &str = "VmbxSimTL";

fn interface_id(kind: InterfaceKind) -> &'static str {
    match kind {
        InterfaceKind::GigE => "SIM_GigE_IF0",
        InterfaceKind::Usb => "SIM_USB_IF0",
    }
}

struct SimInterface {
    kind: InterfaceKind,
    features: FeatureContainer,
}

/// Transport serving a fixed set of simulated cameras.
pub struct SimTransport {
    cameras: Vec<SimCameraConfig>,
    interfaces: Vec<SimInterface>,
    tl_features: FeatureContainer,
    errors: HashMap<String, ErrorConfig>,
    open: Arc<Mutex<HashSet<String>>>,
}

impl SimTransport {
    /// Transport with the given cameras, enumerated in this order.
    #[must_use]
    pub fn new(cameras: Vec<SimCameraConfig>) -> Self {
        let mut interfaces: Vec<SimInterface> = Vec::new();
        for cam in &cameras {
            if interfaces.iter().any(|i| i.kind == cam.interface) {
                continue;
            }
            let count = cameras.iter().filter(|c| c.interface == cam.interface).count();
            interfaces.push(SimInterface {
                kind: cam.interface,
                features: features::interface(interface_id(cam.interface), cam.interface, count as i64),
            });
        }
        info!(
            cameras = cameras.len(),
            interfaces = interfaces.len(),
            "Simulated transport ready"
        );
        Self {
            cameras,
            interfaces,
            tl_features: features::transport_layer(TRANSPORT_LAYER_ID),
            errors: HashMap::new(),
            open: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Inject failures into one camera.
    #[must_use]
    pub fn with_errors(mut self, camera_id: &str, errors: ErrorConfig) -> Self {
        self.errors.insert(camera_id.to_string(), errors);
        self
    }

    /// Ids of the cameras currently open.
    #[must_use]
    pub fn open_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.open.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn camera_descriptor(cfg: &SimCameraConfig) -> ModuleDescriptor {
        let interface = interface_id(cfg.interface);
        ModuleDescriptor {
            kind: ModuleKind::Camera,
            id: cfg.id.clone(),
            extended_id: format!("{}::{}::{}", TRANSPORT_LAYER_ID, interface, cfg.id),
            name: cfg.model.clone(),
            serial: cfg.serial.clone(),
            model_name: cfg.model.clone(),
            interface_id: Some(interface.to_string()),
            transport_layer_id: Some(TRANSPORT_LAYER_ID.to_string()),
            interface_kind: Some(cfg.interface),
        }
    }

    fn interface_descriptor(kind: InterfaceKind) -> ModuleDescriptor {
        let id = interface_id(kind);
        ModuleDescriptor {
            kind: ModuleKind::Interface,
            id: id.to_string(),
            extended_id: format!("{}::{}", TRANSPORT_LAYER_ID, id),
            name: format!("Simulated {} interface", kind),
            serial: String::new(),
            model_name: String::new(),
            interface_id: None,
            transport_layer_id: Some(TRANSPORT_LAYER_ID.to_string()),
            interface_kind: Some(kind),
        }
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new(vec![SimCameraConfig::default()])
    }
}

#[async_trait]
impl Transport for SimTransport {
    fn list_modules(&self, kind: ModuleKind) -> Result<Vec<ModuleDescriptor>> {
        match kind {
            ModuleKind::TransportLayer => Ok(vec![ModuleDescriptor {
                kind,
                id: TRANSPORT_LAYER_ID.to_string(),
                extended_id: TRANSPORT_LAYER_ID.to_string(),
                name: "Simulated Transport Layer".to_string(),
                serial: String::new(),
                model_name: String::new(),
                interface_id: None,
                transport_layer_id: None,
                interface_kind: None,
            }]),
            ModuleKind::Interface => Ok(self
                .interfaces
                .iter()
                .map(|i| Self::interface_descriptor(i.kind))
                .collect()),
            ModuleKind::Camera => Ok(self.cameras.iter().map(Self::camera_descriptor).collect()),
            ModuleKind::LocalDevice | ModuleKind::Stream => Err(VmbError::NotImplemented(format!(
                "{} modules are not enumerable",
                kind.as_str()
            ))),
        }
    }

    fn module_features(&self, kind: ModuleKind, id: &str) -> Result<FeatureContainer> {
        match kind {
            ModuleKind::TransportLayer if id == TRANSPORT_LAYER_ID => Ok(self.tl_features.clone()),
            ModuleKind::Interface => self
                .interfaces
                .iter()
                .find(|i| interface_id(i.kind) == id)
                .map(|i| i.features.clone())
                .ok_or_else(|| VmbError::NotFound(format!("interface '{}'", id))),
            ModuleKind::TransportLayer => {
                Err(VmbError::NotFound(format!("transport layer '{}'", id)))
            }
            _ => Err(VmbError::InvalidState(format!(
                "{} features are reached through an open camera",
                kind.as_str()
            ))),
        }
    }

    async fn open_camera(&self, id: &str) -> Result<Arc<dyn CameraDevice>> {
        let cfg = self
            .cameras
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| VmbError::NotFound(format!("camera '{}'", id)))?;
        let errors = self.errors.get(id).cloned().unwrap_or_default();
        errors.check(id, "open_camera")?;

        if !self.open.lock().insert(id.to_string()) {
            return Err(VmbError::AlreadyOpen(format!("camera '{}'", id)));
        }
        let camera = SimCamera::new(
            Self::camera_descriptor(cfg),
            cfg.clone(),
            errors,
            Arc::clone(&self.open),
        );
        match camera {
            Ok(camera) => {
                info!(camera_id = %id, "Simulated camera opened");
                Ok(Arc::new(camera))
            }
            Err(err) => {
                self.open.lock().remove(id);
                Err(err)
            }
        }
    }
}
