//! Device orchestration
//!
//! A [`DeviceDetector`] polls for attached ADB devices and tells its
//! [`DeviceListener`]s about changes; the [`BridgeManager`] listens and
//! gives every new device its own bridge on the next free port.

pub mod detector;
pub mod manager;

pub use detector::DeviceDetector;
pub use manager::{BridgeManager, BridgeStatus};

use common::DeviceInfo;

/// Receiver of device presence changes
///
/// Called from the detector's polling task; implementations must not block.
pub trait DeviceListener: Send + Sync {
    /// Devices present when the listener registered
    fn initial_list(&self, devices: &[DeviceInfo]);

    fn device_added(&self, device: &DeviceInfo);

    fn device_removed(&self, device: &DeviceInfo);
}
