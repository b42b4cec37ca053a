//! Bridge lifecycle states

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum BridgeState {
    #[serde(rename = "notInitialized")]
    NotInitialized,
    #[serde(rename = "detached")]
    Detached,
    #[serde(rename = "connectingUSB")]
    ConnectingUsb,
    #[serde(rename = "connectedUSB")]
    ConnectedUsb,
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "errorUSB")]
    ErrorUsb,
    #[serde(rename = "errorTCP")]
    ErrorTcp,
    #[serde(rename = "disconnected")]
    Disconnected,
}

impl BridgeState {
    /// Name reported by status surfaces
    pub fn name(self) -> &'static str {
        match self {
            BridgeState::NotInitialized => "notInitialized",
            BridgeState::Detached => "detached",
            BridgeState::ConnectingUsb => "connectingUSB",
            BridgeState::ConnectedUsb => "connectedUSB",
            BridgeState::Online => "online",
            BridgeState::ErrorUsb => "errorUSB",
            BridgeState::ErrorTcp => "errorTCP",
            BridgeState::Disconnected => "disconnected",
        }
    }

    /// Error states ignore every operation except close
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::ErrorUsb | BridgeState::ErrorTcp)
    }

    /// States from which a USB connect attempt may start
    pub fn can_connect_usb(self) -> bool {
        matches!(self, BridgeState::NotInitialized | BridgeState::Detached)
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
