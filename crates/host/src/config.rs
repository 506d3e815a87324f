//! USB subsystem configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsbConfig {
    /// Rescan period when hotplug is unavailable or disabled
    #[serde(default = "UsbConfig::default_scan_interval")]
    pub scan_interval_ms: u64,
    /// Use libusb hotplug events to trigger rescans when supported
    #[serde(default = "UsbConfig::default_true")]
    pub use_hotplug: bool,
    /// Per-transfer timeout handed to the backend (0 = none)
    #[serde(default)]
    pub transfer_timeout_ms: u64,
    /// Capacity of the backend -> consumer pump queue
    #[serde(default = "UsbConfig::default_queue_capacity")]
    pub pump_queue_capacity: usize,
    /// Close() logs a warning each time it has waited this long for the backend
    #[serde(default = "UsbConfig::default_close_warn")]
    pub close_warn_after_ms: u64,
    /// Hide root hubs (VID 0x1d6b, class 9) from the device list
    #[serde(default = "UsbConfig::default_true")]
    pub skip_root_hubs: bool,
    /// Device filters (VID:PID patterns), empty = all devices
    #[serde(default)]
    pub filters: Vec<String>,
    #[serde(default = "UsbConfig::default_log_level")]
    pub log_level: String,
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: Self::default_scan_interval(),
            use_hotplug: true,
            transfer_timeout_ms: 0,
            pump_queue_capacity: Self::default_queue_capacity(),
            close_warn_after_ms: Self::default_close_warn(),
            skip_root_hubs: true,
            filters: Vec::new(),
            log_level: Self::default_log_level(),
        }
    }
}

impl UsbConfig {
    fn default_scan_interval() -> u64 {
        1000
    }

    fn default_true() -> bool {
        true
    }

    fn default_queue_capacity() -> usize {
        256
    }

    fn default_close_warn() -> u64 {
        2000
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        (self.transfer_timeout_ms > 0).then(|| Duration::from_millis(self.transfer_timeout_ms))
    }

    pub fn close_warn_after(&self) -> Duration {
        Duration::from_millis(self.close_warn_after_ms.max(1))
    }

    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/vusb/usb.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: UsbConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
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

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("vusb").join("usb.toml")
        } else {
            PathBuf::from(".config/vusb/usb.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.pump_queue_capacity == 0 {
            return Err(anyhow!("pump_queue_capacity must be greater than 0"));
        }

        if self.scan_interval_ms == 0 {
            return Err(anyhow!("scan_interval_ms must be greater than 0"));
        }

        for filter in &self.filters {
            Self::validate_filter(filter)?;
        }

        Ok(())
    }

    /// Check if a VID/PID pair passes the configured filters
    pub fn allows(&self, vid: u16, pid: u16) -> bool {
        // If no filters are defined, all devices are allowed
        if self.filters.is_empty() {
            return true;
        }

        self.filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            Self::id_matches(filter_vid, vid) && Self::id_matches(filter_pid, pid)
        })
    }

    fn id_matches(pattern: &str, id: u16) -> bool {
        if pattern == "*" {
            return true;
        }
        let hex = pattern
            .strip_prefix("0x")
            .or_else(|| pattern.strip_prefix("0X"))
            .unwrap_or(pattern);
        u16::from_str_radix(hex, 16)
            .map(|v| v == id)
            .unwrap_or(false)
    }

    /// Validate a USB device filter pattern (VID:PID)
    fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);

        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }

        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UsbConfig::default();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.scan_interval(), Duration::from_secs(1));
        assert!(config.transfer_timeout().is_none());
        assert!(config.skip_root_hubs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(UsbConfig::validate_filter("0x1234:0x5678").is_ok());
        assert!(UsbConfig::validate_filter("0x1234:*").is_ok());
        assert!(UsbConfig::validate_filter("*:0x5678").is_ok());
        assert!(UsbConfig::validate_filter("*:*").is_ok());
        assert!(UsbConfig::validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(UsbConfig::validate_filter("1234:5678").is_err());
        assert!(UsbConfig::validate_filter("0x1234").is_err());
        assert!(UsbConfig::validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(UsbConfig::validate_filter("0xGHIJ:0x5678").is_err());
        assert!(UsbConfig::validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_filter_logic() {
        let config = UsbConfig {
            filters: vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()],
            ..UsbConfig::default()
        };

        assert!(config.allows(0x1234, 0x5678));
        assert!(config.allows(0xABCD, 0x1111));
        assert!(!config.allows(0x1234, 0x9999));
        assert!(!config.allows(0x9999, 0x5678));

        // Empty filters = allow all
        assert!(UsbConfig::default().allows(0x1234, 0x5678));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = UsbConfig {
            pump_queue_capacity: 0,
            ..UsbConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: UsbConfig = toml::from_str("transfer_timeout_ms = 250\n").unwrap();
        assert_eq!(config.transfer_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.pump_queue_capacity, 256);
        assert!(config.use_hotplug);
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = UsbConfig::default();
        config.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }
}
