use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::{load_json, save_json};
use crate::core::bluetooth::constants::DEVICE_NAME_PREFIX;

const CONFIG_FILE_NAME: &str = "device_config.json";

/// Radio-side settings: which sensors to look for and how long to wait on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Only advertisements whose name starts with this prefix are reported.
    pub name_prefix: String,

    /// A scan stops by itself after this many seconds.
    pub scan_duration_secs: u64,

    /// A scan stops early once this many distinct devices were reported.
    pub max_scanned_devices: usize,

    pub connect_timeout_secs: u64,

    /// Re-send StartTransfer when the link to the same sensor comes back
    /// while a transfer was active.
    pub restore_transfer_on_ready: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
            scan_duration_secs: 10,
            max_scanned_devices: 50,
            connect_timeout_secs: 10,
            restore_transfer_on_ready: true,
        }
    }
}

impl DeviceConfig {
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Loads the config from `config_dir`, falling back to defaults when absent.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        load_json(config_dir, CONFIG_FILE_NAME, "Device config").await
    }

    /// Saves the config to `config_dir`, creating the directory if needed.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        save_json(self, config_dir, CONFIG_FILE_NAME, "Device config").await
    }
}
