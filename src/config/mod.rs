pub mod acquisition_config;
pub mod device_config;
pub mod signal_config;

use anyhow::Result;
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

use crate::config::acquisition_config::AcquisitionConfig;
use crate::config::device_config::DeviceConfig;
use crate::config::signal_config::SignalConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub signal: SignalConfig,
    pub acquisition: AcquisitionConfig,
}

impl AppConfig {
    /// Loads every config file from `config_dir`. Missing files fall back to
    /// their defaults.
    pub async fn load(config_dir: &Path) -> Result<Self> {
        Ok(AppConfig {
            device: DeviceConfig::load_config(config_dir).await?,
            signal: SignalConfig::load_config(config_dir).await?,
            acquisition: AcquisitionConfig::load_config(config_dir).await?,
        })
    }

    pub async fn save(&self, config_dir: &Path) -> Result<()> {
        self.device.save_config(config_dir).await?;
        self.signal.save_config(config_dir).await?;
        self.acquisition.save_config(config_dir).await?;
        Ok(())
    }
}

/// Reads `file_name` from `config_dir`. A missing file yields `T::default()`.
pub(crate) async fn load_json<T>(config_dir: &Path, file_name: &str, label: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let file_path = config_dir.join(file_name);
    if !file_path.exists() {
        warn!("{} not found at {:?}, using default.", label, file_path);
        return Ok(T::default());
    }

    let config_json = fs::read_to_string(&file_path).await?;
    let config = serde_json::from_str(&config_json)?;

    info!("{} loaded from {:?}", label, file_path);
    Ok(config)
}

/// Writes `value` as pretty JSON to `config_dir/file_name`.
pub(crate) async fn save_json<T: Serialize>(
    value: &T,
    config_dir: &Path,
    file_name: &str,
    label: &str,
) -> Result<()> {
    ensure_directory_exists(config_dir).await?;

    let file_path = config_dir.join(file_name);
    let config_json = match serde_json::to_string_pretty(value) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize {} to JSON: {}", label.to_lowercase(), e);
            return Err(e.into());
        }
    };

    fs::write(&file_path, config_json).await?;

    info!("{} saved to {:?}.", label, file_path);
    Ok(())
}

/// Asynchronously ensures that a directory exists, creating it if it does not.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::Metric;
    use crate::core::window::Lead;

    #[tokio::test]
    async fn missing_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.signal.sampling_rate, 200);
        assert_eq!(config.device.name_prefix, "DECG");
    }

    #[tokio::test]
    async fn save_then_load_preserves_changes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("config");

        let mut config = AppConfig::default();
        config.device.scan_duration_secs = 4;
        config.signal.threshold_std_factor = 3.0;
        config.acquisition.default_lead = Lead::Ecg3;
        config.acquisition.active_metric = Metric::Rmssd;
        config.save(&nested).await.unwrap();

        assert!(nested.join("device_config.json").exists());
        assert!(nested.join("signal_config.json").exists());
        assert!(nested.join("acquisition_config.json").exists());

        let loaded = AppConfig::load(&nested).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("signal_config.json"),
            r#"{ "sampling_rate": 250 }"#,
        )
        .unwrap();

        let signal = SignalConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(signal.sampling_rate, 250);
        assert_eq!(signal.default_bpm, 70.0);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("device_config.json"), "not json").unwrap();
        assert!(DeviceConfig::load_config(dir.path()).await.is_err());
    }

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn json_helpers_work_for_any_section() {
        let dir = tempfile::tempdir().unwrap();
        let missing: Sample = load_json(dir.path(), "sample.json", "Sample").await.unwrap();
        assert_eq!(missing, Sample::default());

        let value = Sample {
            name: "lead two".into(),
            count: 3,
        };
        save_json(&value, dir.path(), "sample.json", "Sample").await.unwrap();
        let loaded: Sample = load_json(dir.path(), "sample.json", "Sample").await.unwrap();
        assert_eq!(loaded, value);
    }
}
