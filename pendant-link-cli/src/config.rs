//! Configuration file support for pendant-link.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PENDANT_*)
//! 3. Local config file (./pendant-link.toml)
//! 4. Global config file (~/.config/pendant-link/config.toml)
//!
//! The `[bluetooth]` and `[ble]` tables double as the durable device
//! settings of the transport host: patches from a successful connect are
//! written back to the file the configuration was loaded from.

use directories::ProjectDirs;
use log::{debug, info, warn};
use pendant_link::transport::{BleDevice, ClassicDevice, DeviceSettings, SettingsPatch};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "pendant-link.toml";

/// Default baud rate for USB flashing.
pub const DEFAULT_BAUD: u32 = 460_800;

/// USB and OTA flashing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Install location of the flashing tool (contains `bin/`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_dir: Option<PathBuf>,
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    /// Baud rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud: Option<u32>,
    /// Default device address for OTA uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ota_address: Option<String>,
}

/// Bluetooth Classic device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BluetoothConfig {
    /// Reconnect automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,
    /// Last connected device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<ClassicDevice>,
}

/// BLE device settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BleConfig {
    /// Reconnect automatically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_connect: Option<bool>,
    /// Last connected device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<BleDevice>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
    /// Bluetooth Classic configuration.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    /// BLE configuration.
    #[serde(default)]
    pub ble: BleConfig,
    /// File the highest-priority settings came from.
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
                config.source = Some(global_path);
            }
        }

        // Load local config (overrides global)
        let local_path = Path::new(LOCAL_CONFIG);
        if let Some(local_config) = Self::load_from_file(local_path) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
            config.source = Some(local_path.to_path_buf());
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        let mut config = if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        };
        config.source = Some(path.to_path_buf());
        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pendant-link").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// File settings are written back to.
    pub fn write_target(&self) -> Option<PathBuf> {
        self.source.clone().or_else(Self::global_config_path)
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.flash.tool_dir.is_some() {
            self.flash.tool_dir = other.flash.tool_dir;
        }
        if other.flash.port.is_some() {
            self.flash.port = other.flash.port;
        }
        if other.flash.baud.is_some() {
            self.flash.baud = other.flash.baud;
        }
        if other.flash.ota_address.is_some() {
            self.flash.ota_address = other.flash.ota_address;
        }

        if other.bluetooth.device.is_some() {
            self.bluetooth.device = other.bluetooth.device;
        }
        if other.bluetooth.auto_connect.is_some() {
            self.bluetooth.auto_connect = other.bluetooth.auto_connect;
        }
        if other.ble.device.is_some() {
            self.ble.device = other.ble.device;
        }
        if other.ble.auto_connect.is_some() {
            self.ble.auto_connect = other.ble.auto_connect;
        }
    }

    /// Device settings as the transport host exposes them.
    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            bluetooth_device: self.bluetooth.device.clone(),
            bluetooth_auto_connect: self.bluetooth.auto_connect.unwrap_or(false),
            ble_device: self.ble.device.clone(),
            ble_auto_connect: self.ble.auto_connect.unwrap_or(false),
        }
    }

    /// Apply a settings patch in memory.
    pub fn apply(&mut self, patch: &SettingsPatch) {
        if let Some(device) = &patch.bluetooth_device {
            self.bluetooth.device = Some(device.clone());
        }
        if let Some(flag) = patch.bluetooth_auto_connect {
            self.bluetooth.auto_connect = Some(flag);
        }
        if let Some(device) = &patch.ble_device {
            self.ble.device = Some(device.clone());
        }
        if let Some(flag) = patch.ble_auto_connect {
            self.ble.auto_connect = Some(flag);
        }
    }

    /// Apply `patch` to the file at [`Config::write_target`], leaving its
    /// other contents alone.
    pub fn persist(&self, patch: &SettingsPatch) -> anyhow::Result<()> {
        let path = self
            .write_target()
            .ok_or_else(|| anyhow::anyhow!("no configuration directory available"))?;
        Self::persist_to(&path, patch)
    }

    fn persist_to(path: &Path, patch: &SettingsPatch) -> anyhow::Result<()> {
        let mut on_disk = if path.exists() {
            toml::from_str(&fs::read_to_string(path)?)?
        } else {
            Self::default()
        };
        on_disk.apply(patch);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(&on_disk)?)?;
        info!("Saved device settings to {}", path.display());
        Ok(())
    }
}
