//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// USB claim, transfer or reset failure
    #[error("USB error: {0}")]
    Usb(String),

    /// Read or write failure on a TCP client socket
    #[error("TCP error: {0}")]
    Tcp(String),

    #[error("Failed to bind TCP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
