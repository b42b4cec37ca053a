//! USB subsystem
//!
//! - Device enumeration and reset through libusb
//! - Claiming the ADB interface of one device
//! - The read/write pump threads that move packets over its bulk endpoints
//!
//! Blocking USB calls stay on dedicated threads or the blocking pool so the
//! Tokio runtime never waits on libusb.

pub mod device;
pub mod discovery;
pub mod pump;

pub use device::{RusbConnector, RusbTransport};
pub use discovery::{DeviceScan, RusbLister, reset_by_serial, reset_by_vid_pid, scan_devices};
pub use pump::{PumpEvent, PumpWriter, UsbPumpPair};
