//! rusb-backed ADB interface access
//!
//! Opens a device by vendor/product id and serial number, locates its ADB
//! interface, claims it and exposes the two bulk endpoints through
//! [`UsbTransport`].

use common::{DeviceInfo, Error, Result, TransportError, UsbConnector, UsbTransport};
use rusb::{ConfigDescriptor, Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Vendor specific interface class
pub const ADB_CLASS: u8 = 0xff;
pub const ADB_SUBCLASS: u8 = 0x42;
pub const ADB_PROTOCOL: u8 = 0x01;

/// Whether an interface setting carries the ADB class triple
pub fn is_adb_interface(class: u8, subclass: u8, protocol: u8) -> bool {
    class == ADB_CLASS && subclass == ADB_SUBCLASS && protocol == ADB_PROTOCOL
}

/// Endpoint descriptor fields relevant to ADB interface matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSpec {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

/// Resolved bulk endpoints of an ADB interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub max_packet_size: u16,
}

/// Pick the bulk IN/OUT pair; the interface must have exactly two endpoints
pub fn select_bulk_endpoints(endpoints: &[EndpointSpec]) -> Option<BulkEndpoints> {
    if endpoints.len() != 2 {
        return None;
    }
    let bulk = |dir: Direction| {
        endpoints
            .iter()
            .find(|ep| ep.direction == dir && ep.transfer_type == TransferType::Bulk)
    };
    let bulk_in = bulk(Direction::In)?;
    let bulk_out = bulk(Direction::Out)?;
    Some(BulkEndpoints {
        bulk_in: bulk_in.address,
        bulk_out: bulk_out.address,
        max_packet_size: bulk_out.max_packet_size,
    })
}

/// Location of the ADB interface inside the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdbInterface {
    pub number: u8,
    pub setting: u8,
    pub endpoints: BulkEndpoints,
}

/// Find the first interface setting that looks like ADB
pub fn find_adb_interface(config: &ConfigDescriptor) -> Option<AdbInterface> {
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            if !is_adb_interface(desc.class_code(), desc.sub_class_code(), desc.protocol_code()) {
                continue;
            }
            let endpoints: Vec<EndpointSpec> = desc
                .endpoint_descriptors()
                .map(|ep| EndpointSpec {
                    address: ep.address(),
                    direction: ep.direction(),
                    transfer_type: ep.transfer_type(),
                    max_packet_size: ep.max_packet_size(),
                })
                .collect();
            if let Some(endpoints) = select_bulk_endpoints(&endpoints) {
                return Some(AdbInterface {
                    number: desc.interface_number(),
                    setting: desc.setting_number(),
                    endpoints,
                });
            }
        }
    }
    None
}

/// Whether any configuration of `device` exposes an ADB interface
pub fn has_adb_interface<T: UsbContext>(device: &Device<T>) -> bool {
    let Ok(descriptor) = device.device_descriptor() else {
        return false;
    };
    (0..descriptor.num_configurations()).any(|n| {
        device
            .config_descriptor(n)
            .map(|config| find_adb_interface(&config).is_some())
            .unwrap_or(false)
    })
}

/// Map a rusb error onto the transport taxonomy
pub fn map_rusb_error(err: rusb::Error) -> TransportError {
    match err {
        rusb::Error::Timeout => TransportError::Timeout,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransportError::Disconnected,
        other => TransportError::Io(other.to_string()),
    }
}

/// Open the attached device matching `info`'s vid, pid and serial number
///
/// Devices sharing a vid/pid are told apart by serial number.
pub fn open_device(context: &Context, info: &DeviceInfo) -> Result<DeviceHandle<Context>> {
    let devices = context
        .devices()
        .map_err(|e| Error::Usb(format!("Failed to enumerate devices: {}", e)))?;

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != info.vendor_id || descriptor.product_id() != info.product_id
        {
            continue;
        }
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "Failed to open {:04x}:{:04x} at bus {} address {}: {}",
                    info.vendor_id,
                    info.product_id,
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        match handle.read_serial_number_string_ascii(&descriptor) {
            Ok(serial) if serial == info.serial_number => return Ok(handle),
            Ok(_) => {}
            Err(e) => warn!("Error retrieving serial number: {}", e),
        }
    }

    Err(Error::DeviceNotFound(info.serial_number.clone()))
}

/// Claims ADB interfaces through libusb
pub struct RusbConnector {
    context: Context,
}

impl RusbConnector {
    pub fn new() -> Result<Self> {
        let context =
            Context::new().map_err(|e| Error::Usb(format!("Failed to create USB context: {}", e)))?;
        Ok(Self { context })
    }
}

impl UsbConnector for RusbConnector {
    fn connect(&self, info: &DeviceInfo) -> Result<Arc<dyn UsbTransport>> {
        let mut handle = open_device(&self.context, info)?;
        debug!("Device {} open", info.serial_number);

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        let config = handle
            .device()
            .active_config_descriptor()
            .map_err(|e| Error::Usb(format!("Could not retrieve active config: {}", e)))?;
        let interface = find_adb_interface(&config).ok_or_else(|| {
            Error::Usb(format!("No ADB interface on device {}", info.serial_number))
        })?;
        debug!(
            "Found ADB interface {} (setting {}), bulk in {:#04x}, bulk out {:#04x}",
            interface.number,
            interface.setting,
            interface.endpoints.bulk_in,
            interface.endpoints.bulk_out
        );

        handle.claim_interface(interface.number).map_err(|e| {
            Error::Usb(format!(
                "Failed to claim interface {}: {}",
                interface.number, e
            ))
        })?;

        if let Err(e) = handle.set_alternate_setting(interface.number, interface.setting) {
            let _ = handle.release_interface(interface.number);
            return Err(Error::Usb(format!(
                "Failed to select alternate setting {}: {}",
                interface.setting, e
            )));
        }

        info!("Device '{}' USB connection ready", info.serial_number);
        Ok(Arc::new(RusbTransport {
            handle,
            interface: interface.number,
            endpoints: interface.endpoints,
        }))
    }
}

/// A claimed ADB interface
///
/// The interface is released when the transport is dropped.
pub struct RusbTransport {
    handle: DeviceHandle<Context>,
    interface: u8,
    endpoints: BulkEndpoints,
}

impl UsbTransport for RusbTransport {
    fn read_bulk(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        self.handle
            .read_bulk(self.endpoints.bulk_in, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn write_bulk(
        &self,
        buf: &[u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        self.handle
            .write_bulk(self.endpoints.bulk_out, buf, timeout)
            .map_err(map_rusb_error)
    }

    fn max_packet_size(&self) -> usize {
        match self.endpoints.max_packet_size {
            0 => protocol::USB_MAX_PACKET_SIZE,
            size => size as usize,
        }
    }
}

impl Drop for RusbTransport {
    fn drop(&mut self) {
        match self.handle.release_interface(self.interface) {
            Ok(()) => debug!("Released ADB interface {}", self.interface),
            Err(e) => debug!("Could not release interface {}: {}", self.interface, e),
        }
    }
}
