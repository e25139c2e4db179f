//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use vmbx::{Camera, System, VmbxConfig};
use vmbx_core::module::InterfaceKind;
use vmbx_sim::{SimCameraConfig, SimTransport};

pub const WAIT: Duration = Duration::from_secs(2);

/// Two small cameras: `DEV_A` on USB, `DEV_G` on GigE.
pub fn cameras() -> Vec<SimCameraConfig> {
    vec![
        SimCameraConfig::small("DEV_A", InterfaceKind::Usb),
        SimCameraConfig::small("DEV_G", InterfaceKind::GigE),
    ]
}

pub fn config() -> VmbxConfig {
    let mut config = VmbxConfig::default();
    config.simulation.cameras = cameras();
    config
}

pub fn system() -> System {
    System::from_config(config()).unwrap()
}

pub fn system_on(transport: SimTransport) -> System {
    System::startup_with(Arc::new(transport), config()).unwrap()
}

pub async fn open(system: &System, id: &str) -> Camera {
    system.open_by_id(id).await.unwrap()
}

/// Poll `condition` until it holds or `WAIT` elapses.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
