//! Common utilities for the ADB USB bridge
//!
//! This crate provides what the daemon's components share: the error type,
//! logging setup, the process shutdown signal, and the USB identity and
//! transport traits the bridge is written against.

pub mod error;
pub mod logging;
pub mod shutdown;
pub mod test_utils;
pub mod usb_types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use shutdown::{ShutdownSignal, wait_for_signal};
pub use usb_types::{DeviceInfo, DeviceLister, TransportError, UsbConnector, UsbTransport};
