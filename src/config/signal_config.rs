use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::{load_json, save_json};

const CONFIG_FILE_NAME: &str = "signal_config.json";

/// Tuning for the R-peak detector and the heart-rate/HRV estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Samples per second produced by the sensor.
    pub sampling_rate: u32,

    /// Raw ADC counts per unit of the calibrated signal.
    pub calibration_divisor: f64,

    /// First-order high-pass cutoff (Hz). Removes baseline wander.
    pub high_pass_cutoff_hz: f64,

    /// First-order low-pass cutoff (Hz). Suppresses muscle and mains noise.
    pub low_pass_cutoff_hz: f64,

    /// Length of each adaptive-threshold sub-window, in seconds.
    pub threshold_window_secs: f64,

    /// Threshold is mean + `threshold_std_factor` * std per sub-window.
    pub threshold_std_factor: f64,

    /// Samples skipped at both ends of the window during peak search.
    pub edge_margin: usize,

    /// A candidate must be the maximum within this many samples on each side.
    pub local_max_radius: usize,

    /// Minimum spacing between accepted peaks, in seconds.
    pub refractory_secs: f64,

    /// Peaks whose RR interval deviates more than this many std from the
    /// mean interval are discarded.
    pub outlier_std_factor: f64,

    pub min_bpm: f64,
    pub max_bpm: f64,

    /// Valid intervals required before a cycle yields a confident estimate.
    pub min_valid_intervals: usize,

    /// Fraction trimmed from each tail before averaging instantaneous rates.
    pub trim_fraction: f64,

    /// Trimming only kicks in with at least this many values.
    pub trim_min_values: usize,

    /// A new estimate is clamped to history average +/- this fraction.
    pub max_deviation: f64,

    /// Weight of the history average in the published rate.
    pub history_weight: f64,

    /// Reported when no history is available and detection fails.
    pub default_bpm: f64,

    /// The RR tachogram is resampled at this rate before spectral analysis.
    pub tachogram_resample_hz: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        SignalConfig {
            sampling_rate: 200,
            calibration_divisor: 6727.4,
            high_pass_cutoff_hz: 0.05,
            low_pass_cutoff_hz: 20.0,
            threshold_window_secs: 1.0,
            threshold_std_factor: 2.5,
            edge_margin: 5,
            local_max_radius: 2,
            refractory_secs: 0.5,
            outlier_std_factor: 2.0,
            min_bpm: 40.0,
            max_bpm: 200.0,
            min_valid_intervals: 3,
            trim_fraction: 0.25,
            trim_min_values: 5,
            max_deviation: 0.15,
            history_weight: 0.7,
            default_bpm: 70.0,
            tachogram_resample_hz: 4.0,
        }
    }
}

impl SignalConfig {
    pub fn sampling_rate_hz(&self) -> f64 {
        f64::from(self.sampling_rate.max(1))
    }

    /// Loads the config from `config_dir`, falling back to defaults when absent.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        load_json(config_dir, CONFIG_FILE_NAME, "Signal config").await
    }

    /// Saves the config to `config_dir`, creating the directory if needed.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        save_json(self, config_dir, CONFIG_FILE_NAME, "Signal config").await
    }
}
