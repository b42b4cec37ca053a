//! USB device identity and transport abstractions
//!
//! The daemon talks to devices through two narrow traits so the pump and
//! bridge logic can run against real hardware (rusb) or an in-memory mock.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

/// Identity of an attached ADB-capable device
///
/// Equality and hashing use only the serial number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial_number: String,
    pub product_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Human readable descriptor summary (bus, address, strings)
    pub usb_info: String,
}

impl DeviceInfo {
    pub fn new(
        serial_number: impl Into<String>,
        product_name: impl Into<String>,
        vendor_id: u16,
        product_id: u16,
    ) -> Self {
        let serial_number = serial_number.into();
        let product_name = product_name.into();
        let usb_info = format!(
            "{:04x}:{:04x} {} ({})",
            vendor_id, product_id, product_name, serial_number
        );
        Self {
            serial_number,
            product_name,
            vendor_id,
            product_id,
            usb_info,
        }
    }

    pub fn with_usb_info(mut self, usb_info: impl Into<String>) -> Self {
        self.usb_info = usb_info.into();
        self
    }
}

impl PartialEq for DeviceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.serial_number == other.serial_number
    }
}

impl Eq for DeviceInfo {}

impl Hash for DeviceInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serial_number.hash(state);
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] {}",
            self.serial_number, self.vendor_id, self.product_id, self.product_name
        )
    }
}

/// Bulk transfer failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No data within the poll timeout; not a link failure
    #[error("transfer timed out")]
    Timeout,

    #[error("device disconnected")]
    Disconnected,

    #[error("transfer failed: {0}")]
    Io(String),
}

/// A claimed ADB interface with resolved bulk endpoints
///
/// Dropping the last reference releases the interface.
pub trait UsbTransport: Send + Sync {
    /// Read one bulk-in transfer into `buf`, returning the byte count
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Write one bulk-out transfer; an empty `buf` is a zero-length packet
    fn write_bulk(&self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Max packet size of the bulk-out endpoint
    fn max_packet_size(&self) -> usize {
        protocol::USB_MAX_PACKET_SIZE
    }
}

/// Claims the ADB interface of a device
///
/// Blocking; async callers run it on the blocking pool.
pub trait UsbConnector: Send + Sync {
    fn connect(&self, device: &DeviceInfo) -> crate::Result<Arc<dyn UsbTransport>>;
}

/// Enumerates attached ADB devices
pub trait DeviceLister: Send + Sync {
    fn list_devices(&self) -> crate::Result<Vec<DeviceInfo>>;
}
