//! systemd readiness notifications
//!
//! Speaks the sd-notify datagram protocol when the daemon runs as a
//! `Type=notify` unit. Outside systemd every call is a no-op.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::debug;

fn notify(message: &str) -> Result<()> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(());
    };
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    debug!("Notified systemd: {}", message);
    Ok(())
}

/// Bridges are being started and devices are polled
pub fn notify_ready() -> Result<()> {
    notify("READY=1")
}

pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1")
}

/// Free-form status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={}", status))
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}
