//! Daemon configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    /// First TCP port handed out; later devices get consecutive ports
    #[serde(default = "DaemonSettings::default_base_port")]
    pub base_port: u16,
    /// Address the per-device listeners bind to
    #[serde(default = "DaemonSettings::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
    /// Device presence poll interval in seconds
    #[serde(default = "DaemonSettings::default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            base_port: Self::default_base_port(),
            bind_addr: Self::default_bind_addr(),
            log_level: Self::default_log_level(),
            poll_interval_secs: Self::default_poll_interval(),
        }
    }
}

impl DaemonSettings {
    fn default_base_port() -> u16 {
        16100
    }

    fn default_bind_addr() -> String {
        "0.0.0.0".to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_poll_interval() -> u64 {
        5
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Per-bridge timing and queue sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Delay before reclaiming a detached device
    #[serde(default = "BridgeSettings::default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    /// Bound on each bulk-out transfer
    #[serde(default = "BridgeSettings::default_usb_write_timeout")]
    pub usb_write_timeout_ms: u64,
    /// Bulk-in poll timeout; only controls how fast the read pump notices stop
    #[serde(default = "BridgeSettings::default_usb_read_poll")]
    pub usb_read_poll_ms: u64,
    #[serde(default = "BridgeSettings::default_pump_stop_timeout")]
    pub pump_stop_timeout_ms: u64,
    #[serde(default = "BridgeSettings::default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Packets waiting for the USB write pump
    #[serde(default = "BridgeSettings::default_write_queue")]
    pub write_queue_capacity: usize,
    /// Packets read from USB waiting for the TCP sender
    #[serde(default = "BridgeSettings::default_read_queue")]
    pub read_queue_capacity: usize,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            reconnect_backoff_ms: Self::default_reconnect_backoff(),
            usb_write_timeout_ms: Self::default_usb_write_timeout(),
            usb_read_poll_ms: Self::default_usb_read_poll(),
            pump_stop_timeout_ms: Self::default_pump_stop_timeout(),
            close_timeout_ms: Self::default_close_timeout(),
            write_queue_capacity: Self::default_write_queue(),
            read_queue_capacity: Self::default_read_queue(),
        }
    }
}

impl BridgeSettings {
    fn default_reconnect_backoff() -> u64 {
        5000
    }

    fn default_usb_write_timeout() -> u64 {
        500
    }

    fn default_usb_read_poll() -> u64 {
        1000
    }

    fn default_pump_stop_timeout() -> u64 {
        5000
    }

    fn default_close_timeout() -> u64 {
        10_000
    }

    fn default_write_queue() -> usize {
        64
    }

    fn default_read_queue() -> usize {
        256
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn usb_write_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_write_timeout_ms)
    }

    pub fn usb_read_poll(&self) -> Duration {
        Duration::from_millis(self.usb_read_poll_ms)
    }

    pub fn pump_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_stop_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl DaemonConfig {
    /// Load configuration from `path`, or from the first standard location
    /// that exists
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            Self::candidate_paths()
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load from the standard locations or fall back to defaults
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("{}", e);
                Self::default()
            }
        }
    }

    /// Load from an explicit path given on the command line
    ///
    /// `~` is expanded. Unlike [`DaemonConfig::load_or_default`], a missing
    /// or broken file is an error.
    pub fn load_from_arg(path: &str) -> Result<Self> {
        let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(path_buf))
    }

    /// Save configuration as pretty TOML, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Per-user configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("adb-usb-bridge").join("daemon.toml")
        } else {
            PathBuf::from(".config/adb-usb-bridge/daemon.toml")
        }
    }

    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            Self::default_path(),
            PathBuf::from("/etc/adb-usb-bridge/daemon.toml"),
        ]
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        self.daemon
            .bind_addr
            .parse::<IpAddr>()
            .map_err(|_| anyhow!("Invalid bind_addr '{}'", self.daemon.bind_addr))?;

        if self.daemon.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be greater than 0"));
        }

        let bridge = &self.bridge;
        let timeouts = [
            ("reconnect_backoff_ms", bridge.reconnect_backoff_ms),
            ("usb_write_timeout_ms", bridge.usb_write_timeout_ms),
            ("usb_read_poll_ms", bridge.usb_read_poll_ms),
            ("pump_stop_timeout_ms", bridge.pump_stop_timeout_ms),
            ("close_timeout_ms", bridge.close_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        if bridge.write_queue_capacity == 0 || bridge.read_queue_capacity == 0 {
            return Err(anyhow!("Queue capacities must be greater than 0"));
        }

        Ok(())
    }
}

/// Parse a USB vendor or product id given as decimal or `0x` hex
pub fn parse_usb_id(id: &str) -> Result<u16> {
    let id = id.trim();
    let parsed = if let Some(hex) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
        if hex.is_empty() || hex.len() > 4 {
            return Err(anyhow!("Invalid USB id '{}', hex part must be 1-4 digits", id));
        }
        u16::from_str_radix(hex, 16)
    } else {
        id.parse::<u16>()
    };
    parsed.map_err(|_| anyhow!("Invalid USB id '{}', expected decimal or 0x hex", id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.base_port, 16100);
        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.bridge.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.bridge.usb_write_timeout(), Duration::from_millis(500));
        assert_eq!(config.bridge.close_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_usb_id() {
        assert_eq!(parse_usb_id("0x18d1").unwrap(), 0x18d1);
        assert_eq!(parse_usb_id("0X4EE7").unwrap(), 0x4ee7);
        assert_eq!(parse_usb_id("6353").unwrap(), 6353);
        assert!(parse_usb_id("0x").is_err());
        assert!(parse_usb_id("0x12345").is_err());
        assert!(parse_usb_id("70000").is_err());
        assert!(parse_usb_id("pixel").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = DaemonConfig::default();
        config.daemon.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.daemon.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = DaemonConfig::default();
        config.bridge.usb_read_poll_ms = 0;
        assert!(config.validate().is_err());
    }
}
