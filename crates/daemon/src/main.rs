//! adb-usb-bridge
//!
//! Exposes Android devices attached over USB as ADB packet streams on TCP
//! ports, one port per device.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use common::{DeviceInfo, ShutdownSignal, setup_logging, wait_for_signal};
use daemon::bridge::{Bridge, BridgeContext};
use daemon::config::{DaemonConfig, parse_usb_id};
use daemon::orchestration::{BridgeManager, DeviceDetector};
use daemon::usb::{
    DeviceScan, RusbConnector, RusbLister, reset_by_serial, reset_by_vid_pid, scan_devices,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};

#[derive(Parser, Debug)]
#[command(name = "adb-usb-bridge")]
#[command(author, version, about = "Bridge ADB devices from USB to TCP")]
#[command(long_about = "
Claims the ADB interface of Android devices attached over USB and forwards
raw ADB packets between each device and its own TCP port. Point any ADB
client at host:port to reach the device.

EXAMPLES:
    # Bridge every attached device, starting at port 16100
    adb-usb-bridge daemon

    # Bridge one known device on a fixed port
    adb-usb-bridge single --serial 0123456789ABCDEF --port 16100 --vid 0x18d1 --pid 0x4ee7

    # Print attached ADB devices as JSON
    adb-usb-bridge list-devices

    # Reset a device that stopped responding
    adb-usb-bridge reset --serial 0123456789ABCDEF

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/adb-usb-bridge/daemon.toml
    3. /etc/adb-usb-bridge/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bridge every attached ADB device (default)
    Daemon,

    /// Bridge a single device on a fixed port
    Single {
        /// Device serial number
        #[arg(long)]
        serial: String,
        /// TCP port to listen on
        #[arg(long)]
        port: u16,
        /// USB vendor id, decimal or 0x hex
        #[arg(long, value_parser = parse_usb_id)]
        vid: u16,
        /// USB product id, decimal or 0x hex
        #[arg(long, value_parser = parse_usb_id)]
        pid: u16,
    },

    /// Print attached ADB devices as JSON and exit
    ListDevices,

    /// Reset a device by serial, or every device matching vid and pid
    Reset {
        #[arg(long, conflicts_with_all = ["vid", "pid"], required_unless_present = "vid")]
        serial: Option<String>,
        #[arg(long, value_parser = parse_usb_id, requires = "pid")]
        vid: Option<u16>,
        #[arg(long, value_parser = parse_usb_id, requires = "vid")]
        pid: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => DaemonConfig::load_from_arg(path).context("Failed to load configuration")?,
        None => DaemonConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    match args.command.unwrap_or(Command::Daemon) {
        Command::Daemon => run_daemon(config).await,
        Command::Single {
            serial,
            port,
            vid,
            pid,
        } => {
            let device = DeviceInfo::new(serial, "", vid, pid);
            run_single(config, device, port).await
        }
        Command::ListDevices => list_devices().await,
        Command::Reset { serial, vid, pid } => reset(serial, vid, pid).await,
    }
}

fn bridge_context(config: &DaemonConfig, shutdown: ShutdownSignal) -> Result<BridgeContext> {
    let bind_addr: IpAddr = config
        .daemon
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.daemon.bind_addr))?;
    Ok(BridgeContext::new(config.bridge.clone(), bind_addr).with_shutdown(shutdown))
}

/// Watch for attached devices and bridge each one
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    info!("adb-usb-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Bridging devices on {} from port {}",
        config.daemon.bind_addr, config.daemon.base_port
    );

    let shutdown = ShutdownSignal::new();
    let span = info_span!("daemon");
    let ctx = bridge_context(&config, shutdown.clone())?.with_span(span);
    let connector = Arc::new(RusbConnector::new().context("Failed to initialize libusb")?);
    let manager = Arc::new(BridgeManager::new(config.daemon.base_port, connector, ctx));

    let detector = DeviceDetector::new(Arc::new(RusbLister), config.daemon.poll_interval());
    if let Err(e) = detector.detect().await {
        warn!("Initial device scan failed: {}", e);
    }
    let devices = detector.add_listener(manager.clone());
    info!("Found {} device(s)", devices.len());
    detector.start_listening();

    notify_ready(devices.len());
    wait_for_signal().await;
    notify_stopping();

    detector.close().await;
    shutdown.trigger();
    for status in manager.bridge_list() {
        info!(serial = %status.serial, port = status.port, state = status.state, "Bridge status");
    }
    let result = manager.close().await;
    info!("Shutdown complete");
    result.map_err(|e| anyhow!("Failed to close bridges: {}", e))
}

/// Bridge one known device until interrupted
async fn run_single(config: DaemonConfig, device: DeviceInfo, port: u16) -> Result<()> {
    info!("Bridging {} on port {}", device, port);

    let ctx = bridge_context(&config, ShutdownSignal::new())?;
    let connector = Arc::new(RusbConnector::new().context("Failed to initialize libusb")?);
    let bridge = Bridge::new(device, port, connector, ctx);
    bridge.start().context("Failed to start bridge")?;

    notify_ready(1);
    wait_for_signal().await;
    notify_stopping();

    info!("Bridge state before shutdown: {}", bridge.current_state_name());
    bridge.close().await.context("Failed to close bridge")?;
    Ok(())
}

/// Print `{"devices": [...], "error": ...}` on stdout
async fn list_devices() -> Result<()> {
    let scan = tokio::task::spawn_blocking(scan_devices)
        .await
        .context("Device scan task failed")?;
    let (devices, error) = match scan {
        Ok(scan) => {
            let error = scan.error_summary();
            let DeviceScan { devices, .. } = scan;
            (devices, error)
        }
        Err(e) => (Vec::new(), Some(e.to_string())),
    };

    let output = serde_json::json!({
        "devices": devices,
        "error": error,
    });
    println!(
        "{}",
        serde_json::to_string(&output).context("Failed to encode device list")?
    );
    Ok(())
}

async fn reset(serial: Option<String>, vid: Option<u16>, pid: Option<u16>) -> Result<()> {
    let result = match (serial, vid, pid) {
        (Some(serial), _, _) => {
            tokio::task::spawn_blocking(move || reset_by_serial(&serial)).await
        }
        (None, Some(vid), Some(pid)) => {
            tokio::task::spawn_blocking(move || reset_by_vid_pid(vid, pid)).await
        }
        _ => return Err(anyhow!("Pass --serial, or both --vid and --pid")),
    };
    result
        .context("Reset task failed")?
        .context("Failed to reset device")?;
    println!("Device reset");
    Ok(())
}

#[cfg(unix)]
fn notify_ready(bridges: usize) {
    if daemon::service::is_systemd() {
        info!("Running under systemd");
    }
    if let Err(e) = daemon::service::notify_ready() {
        error!("Failed to notify systemd: {:#}", e);
    }
    let status = format!("Running - {} device(s) at startup", bridges);
    if let Err(e) = daemon::service::notify_status(&status) {
        error!("Failed to send status to systemd: {:#}", e);
    }
}

#[cfg(not(unix))]
fn notify_ready(_bridges: usize) {}

#[cfg(unix)]
fn notify_stopping() {
    info!("Shutting down");
    if let Err(e) = daemon::service::notify_stopping() {
        error!("Failed to notify systemd: {:#}", e);
    }
}

#[cfg(not(unix))]
fn notify_stopping() {
    info!("Shutting down");
}
