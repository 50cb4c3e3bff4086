use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::{load_json, save_json};
use crate::core::events::Metric;
use crate::core::window::{DEFAULT_EVICTION_BATCH, DEFAULT_WINDOW_CAPACITY, Lead};

const CONFIG_FILE_NAME: &str = "acquisition_config.json";

/// Settings for the sampling window and the periodic detection cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Maximum number of samples retained for analysis.
    pub window_capacity: usize,

    /// Samples evicted from the front at once when the window overflows.
    pub eviction_batch: usize,

    pub default_lead: Lead,

    /// Period of the detection cycle, in milliseconds.
    pub detection_interval_ms: u64,

    /// A cycle is skipped until the window holds this many seconds of signal.
    pub min_detection_secs: f64,

    /// Concurrent analysis jobs allowed on the blocking pool.
    pub worker_pool_size: usize,

    pub active_metric: Metric,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        AcquisitionConfig {
            window_capacity: DEFAULT_WINDOW_CAPACITY,
            eviction_batch: DEFAULT_EVICTION_BATCH,
            default_lead: Lead::Ecg1,
            detection_interval_ms: 2000,
            min_detection_secs: 2.0,
            worker_pool_size: 4,
            active_metric: Metric::HeartRate,
        }
    }
}

impl AcquisitionConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms.max(1))
    }

    /// Samples needed before a detection cycle runs.
    pub fn min_detection_samples(&self, sampling_rate: f64) -> usize {
        (self.min_detection_secs * sampling_rate).ceil().max(0.0) as usize
    }

    /// Loads the config from `config_dir`, falling back to defaults when absent.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        load_json(config_dir, CONFIG_FILE_NAME, "Acquisition config").await
    }

    /// Saves the config to `config_dir`, creating the directory if needed.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        save_json(self, config_dir, CONFIG_FILE_NAME, "Acquisition config").await
    }
}
