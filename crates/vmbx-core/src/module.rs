//! Module descriptors returned by platform enumeration.

use serde::Serialize;
use std::fmt;

/// Feature-bearing module categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ModuleKind {
    /// Transport layer (GenTL producer).
    TransportLayer,
    /// Physical interface (NIC, USB host controller).
    Interface,
    /// Remote camera device.
    Camera,
    /// Host-side representation of an opened camera.
    LocalDevice,
    /// Data stream of an opened camera.
    Stream,
}

impl ModuleKind {
    /// Label used in CLI arguments and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::TransportLayer => "transport-layer",
            ModuleKind::Interface => "interface",
            ModuleKind::Camera => "camera",
            ModuleKind::LocalDevice => "local-device",
            ModuleKind::Stream => "stream",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical link type of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum InterfaceKind {
    /// GigE Vision over Ethernet.
    GigE,
    /// USB3 Vision.
    #[serde(rename = "USB")]
    Usb,
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterfaceKind::GigE => f.write_str("GigE"),
            InterfaceKind::Usb => f.write_str("USB"),
        }
    }
}

/// Identity of an enumerated module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleDescriptor {
    /// Category.
    pub kind: ModuleKind,
    /// Short id, unique per kind.
    pub id: String,
    /// Fully qualified id including the parent path.
    pub extended_id: String,
    /// Display name.
    pub name: String,
    /// Serial number (empty for non-camera modules).
    pub serial: String,
    /// Model name (empty for non-camera modules).
    pub model_name: String,
    /// Id of the interface the module hangs off, if any.
    pub interface_id: Option<String>,
    /// Id of the transport layer the module belongs to, if any.
    pub transport_layer_id: Option<String>,
    /// Link type, for interfaces and cameras.
    pub interface_kind: Option<InterfaceKind>,
}

impl fmt::Display for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)?;
        if !self.serial.is_empty() {
            write!(f, " serial {}", self.serial)?;
        }
        if let Some(kind) = self.interface_kind {
            write!(f, " via {}", kind)?;
        }
        Ok(())
    }
}
