//! ADB USB-to-TCP bridge daemon
//!
//! Exposes every attached Android device's ADB interface as a raw packet
//! stream on its own TCP port. The binary in `main.rs` wires these modules
//! together; integration tests drive them directly with mock USB devices.

pub mod bridge;
pub mod config;
pub mod orchestration;
#[cfg(unix)]
pub mod service;
pub mod usb;

pub use bridge::{Bridge, BridgeContext, BridgeState};
pub use config::DaemonConfig;
pub use orchestration::{BridgeManager, BridgeStatus, DeviceDetector, DeviceListener};
