//! Device enumeration and reset

use crate::usb::device::has_adb_interface;
use common::{DeviceInfo, DeviceLister, Error, Result};
use rusb::{Context, Device, UsbContext};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

/// Result of one enumeration pass
///
/// A device whose strings cannot be read is skipped and its error kept, so
/// one broken device never hides the others.
#[derive(Debug, Default, Serialize)]
pub struct DeviceScan {
    pub devices: Vec<DeviceInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl DeviceScan {
    /// All collected errors joined into one message
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            None
        } else {
            Some(format!(
                "Some devices could not be read (check USB permissions): {}",
                self.errors.join("; ")
            ))
        }
    }
}

/// Enumerate attached devices exposing an ADB interface
pub fn scan_devices() -> Result<DeviceScan> {
    let context =
        Context::new().map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;
    scan_context(&context)
}

fn scan_context(context: &Context) -> Result<DeviceScan> {
    let list = context
        .devices()
        .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

    let mut scan = DeviceScan::default();
    for device in list.iter().filter(|device| has_adb_interface(device)) {
        match read_device_info(&device) {
            Ok(info) => {
                trace!("Found ADB device {}", info);
                scan.devices.push(info);
            }
            Err(e) => {
                warn!("{}, skipping device", e);
                scan.errors.push(e.to_string());
            }
        }
    }
    Ok(scan)
}

fn read_device_info<T: UsbContext>(device: &Device<T>) -> Result<DeviceInfo> {
    let location = format!("bus {} address {}", device.bus_number(), device.address());
    let descriptor = device
        .device_descriptor()
        .map_err(|e| Error::Usb(format!("Error reading descriptor at {}: {}", location, e)))?;
    let handle = device
        .open()
        .map_err(|e| Error::Usb(format!("Error opening device at {}: {}", location, e)))?;

    let serial = handle
        .read_serial_number_string_ascii(&descriptor)
        .map_err(|e| Error::Usb(format!("Error getting serial at {}: {}", location, e)))?;
    let product = handle
        .read_product_string_ascii(&descriptor)
        .map_err(|e| Error::Usb(format!("Error getting product name at {}: {}", location, e)))?;

    let usb_info = format!(
        "{:04x}:{:04x} {} ({}, speed {:?})",
        descriptor.vendor_id(),
        descriptor.product_id(),
        product,
        location,
        device.speed()
    );
    Ok(
        DeviceInfo::new(serial, product, descriptor.vendor_id(), descriptor.product_id())
            .with_usb_info(usb_info),
    )
}

/// [`DeviceLister`] over libusb, used by the presence poller
pub struct RusbLister;

impl DeviceLister for RusbLister {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let scan = scan_devices()?;
        if let Some(summary) = scan.error_summary() {
            debug!("{}", summary);
        }
        Ok(scan.devices)
    }
}

/// Reset the ADB device with the given serial number
pub fn reset_by_serial(serial: &str) -> Result<()> {
    let context =
        Context::new().map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;
    let list = context
        .devices()
        .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

    for device in list.iter().filter(|device| has_adb_interface(device)) {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let mut handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Could not open device: {}", e);
                continue;
            }
        };
        match handle.read_serial_number_string_ascii(&descriptor) {
            Ok(found) if found == serial => {
                handle
                    .reset()
                    .map_err(|e| Error::Usb(format!("Failed to reset '{}': {}", serial, e)))?;
                info!("Reset device '{}'", serial);
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!("Could not get serial for device: {}", e),
        }
    }

    Err(Error::DeviceNotFound(format!("device '{}' not found", serial)))
}

/// Reset every attached device with the given vendor and product id
///
/// Returns the last reset error, or `DeviceNotFound` if nothing matched.
pub fn reset_by_vid_pid(vendor_id: u16, product_id: u16) -> Result<()> {
    let context =
        Context::new().map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;
    let list = context
        .devices()
        .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

    let mut matched = 0usize;
    let mut last_err = None;
    for device in list.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != vendor_id || descriptor.product_id() != product_id {
            continue;
        }
        matched += 1;
        let result = device.open().and_then(|mut handle| handle.reset());
        match result {
            Ok(()) => info!(
                "Reset {:04x}:{:04x} at bus {} address {}",
                vendor_id,
                product_id,
                device.bus_number(),
                device.address()
            ),
            Err(e) => last_err = Some(e),
        }
    }

    if matched == 0 {
        return Err(Error::DeviceNotFound(format!(
            "no device with id {:04x}:{:04x}",
            vendor_id, product_id
        )));
    }
    match last_err {
        Some(e) => Err(Error::Usb(format!(
            "Failed to reset {:04x}:{:04x}: {}",
            vendor_id, product_id, e
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_summary() {
        let mut scan = DeviceScan::default();
        assert!(scan.error_summary().is_none());

        scan.errors.push("Error getting serial at bus 1 address 4".into());
        let summary = scan.error_summary().unwrap();
        assert!(summary.contains("bus 1 address 4"));
    }

    #[test]
    fn test_scan_serializes_without_empty_errors() {
        let scan = DeviceScan {
            devices: vec![DeviceInfo::new("ABC", "Pixel", 0x18d1, 0x4ee7)],
            errors: Vec::new(),
        };
        let json = serde_json::to_value(&scan).unwrap();
        assert_eq!(json["devices"][0]["serial_number"], "ABC");
        assert!(json.get("errors").is_none());
    }

    #[test]
    fn test_scan_devices_without_hardware() {
        // Enumeration may fail in sandboxes without USB access
        match scan_devices() {
            Ok(scan) => {
                for device in &scan.devices {
                    assert!(!device.serial_number.is_empty());
                }
            }
            Err(e) => eprintln!("USB enumeration unavailable: {}", e),
        }
    }
}
