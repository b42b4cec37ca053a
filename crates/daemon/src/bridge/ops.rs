//! Operations accepted by the bridge dispatcher

use tokio::sync::oneshot;

/// One queued lifecycle transition
///
/// Every state change of a bridge goes through this queue, whichever task
/// noticed the need for it.
#[derive(Debug)]
pub enum BridgeOp {
    /// Claim the USB interface and start a pump pair
    ConnectUsb,
    /// Bind the TCP listener and start routing
    ConnectTcp,
    /// The pump pair of `generation` broke
    UsbFailed { generation: u64, reason: String },
    /// Device gone; retry after the reconnect backoff
    DeviceDetached,
    /// Release everything and stop; `ack` fires once done
    Close { ack: oneshot::Sender<()> },
}

impl BridgeOp {
    pub fn name(&self) -> &'static str {
        match self {
            BridgeOp::ConnectUsb => "connect_usb",
            BridgeOp::ConnectTcp => "connect_tcp",
            BridgeOp::UsbFailed { .. } => "usb_failed",
            BridgeOp::DeviceDetached => "device_detached",
            BridgeOp::Close { .. } => "close",
        }
    }
}
