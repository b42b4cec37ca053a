//! Bridge manager
//!
//! Starts one [`Bridge`] per device serial. Ports are handed out in the
//! order devices are first seen, starting at the base port, and a device
//! keeps its port for the life of the process: a replugged device is picked
//! up again by its existing bridge.

use crate::bridge::{Bridge, BridgeContext};
use crate::orchestration::DeviceListener;
use common::{DeviceInfo, Error, Result, UsbConnector};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Snapshot of one managed bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeStatus {
    pub serial: String,
    pub port: u16,
    pub state: &'static str,
}

#[derive(Default)]
struct ManagerInner {
    bridges: Vec<Arc<Bridge>>,
    next_port: u16,
    closed: bool,
}

pub struct BridgeManager {
    base_port: u16,
    connector: Arc<dyn UsbConnector>,
    ctx: BridgeContext,
    inner: Mutex<ManagerInner>,
}

impl BridgeManager {
    pub fn new(base_port: u16, connector: Arc<dyn UsbConnector>, ctx: BridgeContext) -> Self {
        Self {
            base_port,
            connector,
            ctx,
            inner: Mutex::new(ManagerInner {
                next_port: base_port,
                ..Default::default()
            }),
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Serial, port and state of every bridge, in port order
    pub fn bridge_list(&self) -> Vec<BridgeStatus> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .bridges
            .iter()
            .map(|bridge| BridgeStatus {
                serial: bridge.serial_number().to_string(),
                port: bridge.port(),
                state: bridge.current_state_name(),
            })
            .collect()
    }

    pub fn bridge(&self, serial: &str) -> Option<Arc<Bridge>> {
        let inner = self.inner.lock().ok()?;
        inner
            .bridges
            .iter()
            .find(|bridge| bridge.serial_number() == serial)
            .cloned()
    }

    /// Close every bridge
    ///
    /// Later calls, and devices reported after the first call, are ignored.
    /// All bridges are closed even if some fail; the failures are combined
    /// into one error.
    pub async fn close(&self) -> Result<()> {
        let bridges = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| Error::Other("bridge manager lock poisoned".to_string()))?;
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.bridges.clone()
        };

        info!("Closing {} bridges", bridges.len());
        let mut failures = Vec::new();
        for bridge in bridges {
            if let Err(e) = bridge.close().await {
                warn!(serial = bridge.serial_number(), "Failed to close bridge: {}", e);
                failures.push(format!("{}: {}", bridge.serial_number(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(failures.join("; ")))
        }
    }

    /// Start a bridge for `device` unless its serial is already known
    fn add_device(&self, device: &DeviceInfo) {
        let Ok(mut inner) = self.inner.lock() else {
            error!("Bridge manager lock poisoned, ignoring {}", device);
            return;
        };
        if inner.closed {
            debug!(serial = %device.serial_number, "Manager closed, ignoring device");
            return;
        }
        if inner
            .bridges
            .iter()
            .any(|bridge| bridge.serial_number() == device.serial_number)
        {
            return;
        }

        let port = inner.next_port;
        let Some(next_port) = port.checked_add(1) else {
            error!(serial = %device.serial_number, "No TCP ports left for device");
            return;
        };
        inner.next_port = next_port;

        info!(serial = %device.serial_number, port, "Starting bridge");
        let bridge = Arc::new(Bridge::new(
            device.clone(),
            port,
            Arc::clone(&self.connector),
            self.ctx.clone(),
        ));
        if let Err(e) = bridge.start() {
            error!(serial = %device.serial_number, "Failed to start bridge: {}", e);
        }
        inner.bridges.push(bridge);
    }
}

impl DeviceListener for BridgeManager {
    fn initial_list(&self, devices: &[DeviceInfo]) {
        for device in devices {
            self.add_device(device);
        }
    }

    fn device_added(&self, device: &DeviceInfo) {
        self.add_device(device);
    }

    fn device_removed(&self, device: &DeviceInfo) {
        // The bridge notices on its own and waits for the device to return
        debug!(serial = %device.serial_number, "Device removed");
    }
}
