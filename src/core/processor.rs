//! R-peak detection, heart-rate estimation and HRV metrics
//! The free functions are the individual pipeline stages; `SignalProcessor`
//! chains them over one window snapshot and `HeartRateSmoother` carries the
//! published-rate history between cycles.

use log::debug;
use serde::Serialize;
use std::f64::consts::PI;

use crate::config::signal_config::SignalConfig;

/// Number of published rates kept for smoothing.
pub const HEART_RATE_HISTORY_LEN: usize = 5;

/// Subtracts the window mean and scales by the calibration divisor.
pub fn remove_dc(samples: &[i32], calibration_divisor: f64) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let divisor = if calibration_divisor == 0.0 { 1.0 } else { calibration_divisor };
    let mean = samples.iter().map(|&s| f64::from(s)).sum::<f64>() / samples.len() as f64;
    samples
        .iter()
        .map(|&s| (f64::from(s) - mean) / divisor)
        .collect()
}

fn smoothing_factor(cutoff_hz: f64, sampling_rate: f64) -> f64 {
    (2.0 * PI * cutoff_hz / sampling_rate).clamp(0.0, 1.0)
}

/// First-order DC blocker: `y[i] = (1 - a) * (y[i-1] + x[i] - x[i-1])`.
pub fn high_pass(signal: &[f64], cutoff_hz: f64, sampling_rate: f64) -> Vec<f64> {
    let decay = 1.0 - smoothing_factor(cutoff_hz, sampling_rate);
    let mut out = Vec::with_capacity(signal.len());
    let Some(&first) = signal.first() else {
        return out;
    };
    out.push(first);
    for i in 1..signal.len() {
        let y = decay * (out[i - 1] + signal[i] - signal[i - 1]);
        out.push(y);
    }
    out
}

/// Exponential smoother: `y[i] = a * x[i] + (1 - a) * y[i-1]`.
pub fn low_pass(signal: &[f64], cutoff_hz: f64, sampling_rate: f64) -> Vec<f64> {
    let alpha = smoothing_factor(cutoff_hz, sampling_rate);
    let mut out = Vec::with_capacity(signal.len());
    let Some(&first) = signal.first() else {
        return out;
    };
    out.push(first);
    for i in 1..signal.len() {
        let y = alpha * signal[i] + (1.0 - alpha) * out[i - 1];
        out.push(y);
    }
    out
}

fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Average of `mean + std_factor * std` over consecutive sub-windows.
///
/// A trailing sub-window shorter than half of `window_len` is ignored. When no
/// sub-window qualifies the whole signal is used.
pub fn adaptive_threshold(signal: &[f64], window_len: usize, std_factor: f64) -> f64 {
    let window_len = window_len.max(1);
    let min_len = window_len.div_ceil(2);

    let thresholds: Vec<f64> = signal
        .chunks(window_len)
        .filter(|chunk| chunk.len() >= min_len)
        .map(|chunk| {
            let (mean, std) = mean_and_std(chunk);
            mean + std_factor * std
        })
        .collect();

    if thresholds.is_empty() {
        let (mean, std) = mean_and_std(signal);
        return mean + std_factor * std;
    }
    thresholds.iter().sum::<f64>() / thresholds.len() as f64
}

/// Parameters of the candidate search in `detect_r_peaks`.
#[derive(Debug, Clone, Copy)]
pub struct PeakSearch {
    pub edge_margin: usize,
    pub local_max_radius: usize,
    /// Minimum distance from the previously accepted peak, in samples.
    pub refractory_samples: usize,
}

/// Returns ascending indices of R-peak candidates.
///
/// Checks run in a fixed order: local maximum, then threshold, then the
/// refractory gap to the last accepted peak. On a plateau only the first
/// sample counts as the maximum.
pub fn detect_r_peaks(signal: &[f64], threshold: f64, search: PeakSearch) -> Vec<usize> {
    let n = signal.len();
    let mut peaks = Vec::new();
    if n <= 2 * search.edge_margin {
        return peaks;
    }

    let mut last_peak: Option<usize> = None;
    for i in search.edge_margin..n - search.edge_margin {
        let value = signal[i];
        let lo = i.saturating_sub(search.local_max_radius);
        let hi = (i + search.local_max_radius).min(n - 1);

        let is_local_max =
            signal[lo..i].iter().all(|&v| value > v) && signal[i + 1..=hi].iter().all(|&v| value >= v);
        if !is_local_max || value <= threshold {
            continue;
        }

        if let Some(last) = last_peak {
            if i - last < search.refractory_samples {
                continue;
            }
        }
        peaks.push(i);
        last_peak = Some(i);
    }
    peaks
}

/// Drops peaks whose adjacent RR interval deviates from the mean interval by
/// more than `std_factor` standard deviations.
///
/// The first peak is judged by the interval that follows it, every other peak
/// by the interval that precedes it. Fewer than three peaks are returned as is.
pub fn reject_outlier_peaks(peaks: &[usize], std_factor: f64) -> Vec<usize> {
    if peaks.len() < 3 {
        return peaks.to_vec();
    }

    let intervals: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let (mean, std) = mean_and_std(&intervals);
    if std == 0.0 {
        return peaks.to_vec();
    }

    let limit = std_factor * std;
    let within = |interval: f64| (interval - mean).abs() <= limit;

    peaks
        .iter()
        .enumerate()
        .filter(|&(i, _)| match i {
            0 => within(intervals[0]),
            _ => within(intervals[i - 1]),
        })
        .map(|(_, &p)| p)
        .collect()
}

/// Instantaneous rates of consecutive peaks, keeping only those in `[min_bpm, max_bpm]`.
pub fn instantaneous_bpm(peaks: &[usize], sampling_rate: f64, min_bpm: f64, max_bpm: f64) -> Vec<f64> {
    peaks
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| 60.0 * sampling_rate / (w[1] - w[0]) as f64)
        .filter(|bpm| (min_bpm..=max_bpm).contains(bpm))
        .collect()
}

/// Mean after dropping `floor(len * fraction)` values from each tail.
/// Trimming only applies with at least `min_values` values.
pub fn trimmed_mean(values: &[f64], fraction: f64, min_values: usize) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let trim = if sorted.len() >= min_values {
        (sorted.len() as f64 * fraction).floor() as usize
    } else {
        0
    };
    let kept = if 2 * trim < sorted.len() {
        &sorted[trim..sorted.len() - trim]
    } else {
        &sorted[..]
    };
    Some(kept.iter().sum::<f64>() / kept.len() as f64)
}

/// Mean heart rate derived from the mean RR interval of `peaks`.
pub fn mean_heart_rate(peaks: &[usize], sampling_rate: f64) -> Option<f64> {
    if peaks.len() < 2 {
        return None;
    }
    let first = *peaks.first()?;
    let last = *peaks.last()?;
    let mean_rr = (last - first) as f64 / (peaks.len() - 1) as f64;
    if mean_rr <= 0.0 {
        return None;
    }
    Some(60.0 * sampling_rate / mean_rr)
}

/// Heart-rate variability metrics. RR intervals are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HrvMetrics {
    /// Population standard deviation of RR intervals.
    pub sdnn: f64,
    /// Root mean square of successive RR differences.
    pub rmssd: f64,
    /// Fraction of successive differences larger than 50 ms.
    pub pnn50: f64,
}

pub fn hrv_metrics(peaks: &[usize], sampling_rate: f64) -> HrvMetrics {
    if peaks.len() < 2 {
        return HrvMetrics::default();
    }

    let rr: Vec<f64> = peaks
        .windows(2)
        .map(|w| (w[1] as f64 - w[0] as f64) / sampling_rate)
        .collect();
    let (_, sdnn) = mean_and_std(&rr);

    let diffs: Vec<f64> = rr.windows(2).map(|w| w[1] - w[0]).collect();
    if diffs.is_empty() {
        return HrvMetrics { sdnn, rmssd: 0.0, pnn50: 0.0 };
    }

    let rmssd = (diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64).sqrt();
    let over_50ms = diffs.iter().filter(|d| d.abs() > 0.05).count();
    let pnn50 = over_50ms as f64 / diffs.len() as f64;

    HrvMetrics { sdnn, rmssd, pnn50 }
}

/// Frequency-domain HRV. Powers are in s² over the resampled tachogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HrvFrequencyMetrics {
    /// Power of every bin above DC up to the Nyquist frequency.
    pub total_power: f64,
    /// 0.0033 to 0.04 Hz.
    pub vlf: f64,
    /// 0.04 to 0.15 Hz.
    pub lf: f64,
    /// 0.15 to 0.4 Hz.
    pub hf: f64,
    /// `None` when there is no HF power.
    pub lf_hf_ratio: Option<f64>,
}

const VLF_BAND: (f64, f64) = (0.0033, 0.04);
const LF_BAND: (f64, f64) = (0.04, 0.15);
const HF_BAND: (f64, f64) = (0.15, 0.4);

/// Band powers of the RR tachogram. The irregular RR series is linearly
/// interpolated at `resample_hz`, mean-removed and zero-padded for the FFT.
/// Fewer than 3 peaks, or a series too short to resample, yields zeros.
pub fn hrv_frequency_metrics(
    peaks: &[usize],
    sampling_rate: f64,
    resample_hz: f64,
) -> HrvFrequencyMetrics {
    if peaks.len() < 3 || resample_hz <= 0.0 {
        return HrvFrequencyMetrics::default();
    }

    // Each interval is stamped with the time of the beat that closes it.
    let beat_times: Vec<f64> = peaks[1..].iter().map(|&p| p as f64 / sampling_rate).collect();
    let rr: Vec<f64> = peaks
        .windows(2)
        .map(|w| (w[1] as f64 - w[0] as f64) / sampling_rate)
        .collect();

    let tachogram = resample_linear(&beat_times, &rr, resample_hz);
    if tachogram.len() < 2 {
        return HrvFrequencyMetrics::default();
    }
    let (mean, _) = mean_and_std(&tachogram);

    let fft_len = tachogram.len().next_power_of_two();
    let mut padded = vec![0.0; fft_len];
    for (slot, value) in padded.iter_mut().zip(&tachogram) {
        *slot = value - mean;
    }
    let spectrum = power_spectrum(&padded);

    let resolution = resample_hz / fft_len as f64;
    let in_band = |f: f64, (low, high): (f64, f64), inclusive_low: bool| {
        (if inclusive_low { f >= low } else { f > low }) && f <= high
    };

    let mut metrics = HrvFrequencyMetrics::default();
    for (bin, power) in spectrum.iter().enumerate().skip(1) {
        let frequency = bin as f64 * resolution;
        metrics.total_power += power;
        if in_band(frequency, VLF_BAND, true) {
            metrics.vlf += power;
        } else if in_band(frequency, LF_BAND, false) {
            metrics.lf += power;
        } else if in_band(frequency, HF_BAND, false) {
            metrics.hf += power;
        }
    }
    metrics.lf_hf_ratio = (metrics.hf > 0.0).then(|| metrics.lf / metrics.hf);
    metrics
}

/// Samples the piecewise-linear curve through `(times, values)` every
/// `1 / rate` seconds, from the first time to the last.
fn resample_linear(times: &[f64], values: &[f64], rate: f64) -> Vec<f64> {
    let (Some(&start), Some(&end)) = (times.first(), times.last()) else {
        return Vec::new();
    };
    if times.len() < 2 || end <= start {
        return Vec::new();
    }

    let count = ((end - start) * rate).floor() as usize + 1;
    let mut out = Vec::with_capacity(count);
    let mut segment = 0;
    for k in 0..count {
        let t = start + k as f64 / rate;
        while segment + 2 < times.len() && times[segment + 1] < t {
            segment += 1;
        }
        let (t0, t1) = (times[segment], times[segment + 1]);
        let (v0, v1) = (values[segment], values[segment + 1]);
        out.push(if t1 > t0 { v0 + (v1 - v0) * (t - t0) / (t1 - t0) } else { v0 });
    }
    out
}

/// |X[k]|² for bins `0..=N/2` of a real signal. `signal.len()` must be a power of two.
fn power_spectrum(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n < 2 {
        return signal.iter().map(|x| x * x).collect();
    }

    let mut real = signal.to_vec();
    let mut imag = vec![0.0; n];

    let bits = n.trailing_zeros();
    for i in 0..n {
        let j = i.reverse_bits() >> (usize::BITS - bits);
        if i < j {
            real.swap(i, j);
            imag.swap(i, j);
        }
    }

    let mut size = 2;
    while size <= n {
        let half = size / 2;
        let angle_step = -2.0 * PI / size as f64;
        for start in (0..n).step_by(size) {
            for k in 0..half {
                let (wi, wr) = (angle_step * k as f64).sin_cos();
                let (i, j) = (start + k, start + k + half);
                let tr = wr * real[j] - wi * imag[j];
                let ti = wr * imag[j] + wi * real[j];
                real[j] = real[i] - tr;
                imag[j] = imag[i] - ti;
                real[i] += tr;
                imag[i] += ti;
            }
        }
        size *= 2;
    }

    (0..=n / 2).map(|k| real[k] * real[k] + imag[k] * imag[k]).collect()
}

/// Everything one detection cycle learns from a window snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleAnalysis {
    pub threshold: f64,
    /// Candidates before outlier rejection.
    pub candidate_count: usize,
    /// Peaks retained after outlier rejection.
    pub peaks: Vec<usize>,
    /// Instantaneous rates inside the physiological bounds.
    pub valid_bpm: Vec<f64>,
    /// Trimmed mean of `valid_bpm`, when enough intervals were valid.
    pub raw_bpm: Option<f64>,
    pub hrv: HrvMetrics,
    pub hrv_frequency: HrvFrequencyMetrics,
}

/// Runs the detection pipeline over window snapshots.
#[derive(Debug, Clone)]
pub struct SignalProcessor {
    config: SignalConfig,
}

impl SignalProcessor {
    pub fn new(config: SignalConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    fn peak_search(&self) -> PeakSearch {
        let rate = self.config.sampling_rate_hz();
        PeakSearch {
            edge_margin: self.config.edge_margin,
            local_max_radius: self.config.local_max_radius,
            refractory_samples: (self.config.refractory_secs * rate).round().max(0.0) as usize,
        }
    }

    /// Filters the snapshot and extracts peaks, the raw rate and HRV.
    /// Never fails; an empty or flat snapshot yields no peaks.
    pub fn analyze(&self, raw: &[i32]) -> CycleAnalysis {
        self.analyze_centered(&remove_dc(raw, self.config.calibration_divisor))
    }

    /// Same as `analyze`, for a snapshot that already went through `remove_dc`.
    pub fn analyze_centered(&self, centered: &[f64]) -> CycleAnalysis {
        let cfg = &self.config;
        let rate = cfg.sampling_rate_hz();

        let band_limited = high_pass(centered, cfg.high_pass_cutoff_hz, rate);
        let filtered = low_pass(&band_limited, cfg.low_pass_cutoff_hz, rate);

        let window_len = (cfg.threshold_window_secs * rate).round().max(1.0) as usize;
        let threshold = adaptive_threshold(&filtered, window_len, cfg.threshold_std_factor);

        let candidates = detect_r_peaks(&filtered, threshold, self.peak_search());
        let peaks = reject_outlier_peaks(&candidates, cfg.outlier_std_factor);

        let valid_bpm = instantaneous_bpm(&peaks, rate, cfg.min_bpm, cfg.max_bpm);
        let raw_bpm = if valid_bpm.len() >= cfg.min_valid_intervals.max(1) {
            trimmed_mean(&valid_bpm, cfg.trim_fraction, cfg.trim_min_values)
        } else {
            None
        };
        let hrv = hrv_metrics(&peaks, rate);
        let hrv_frequency = hrv_frequency_metrics(&peaks, rate, cfg.tachogram_resample_hz);

        debug!(
            "Detection cycle over {} samples: {} candidates, {} retained, {} valid intervals",
            centered.len(),
            candidates.len(),
            peaks.len(),
            valid_bpm.len()
        );

        CycleAnalysis {
            threshold,
            candidate_count: candidates.len(),
            peaks,
            valid_bpm,
            raw_bpm,
            hrv,
            hrv_frequency,
        }
    }
}

/// How a published heart rate was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    /// Enough valid intervals in the current window.
    High,
    /// Detection failed; the value comes from history or the default.
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeartRateEstimate {
    pub bpm: f64,
    pub confidence: Confidence,
}

/// Fixed-capacity ring of the most recent published rates.
#[derive(Debug, Clone)]
pub struct HeartRateHistory<const N: usize> {
    values: [f64; N],
    next: usize,
    len: usize,
}

impl<const N: usize> HeartRateHistory<N> {
    pub fn new() -> Self {
        Self {
            values: [0.0; N],
            next: 0,
            len: 0,
        }
    }

    /// Stores `bpm`, overwriting the oldest entry once full.
    pub fn push(&mut self, bpm: f64) {
        if N == 0 {
            return;
        }
        self.values[self.next] = bpm;
        self.next = (self.next + 1) % N;
        self.len = (self.len + 1).min(N);
    }

    pub fn average(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        Some(self.values[..self.len].iter().sum::<f64>() / self.len as f64)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.next = 0;
        self.len = 0;
    }
}

impl<const N: usize> Default for HeartRateHistory<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns per-cycle raw rates into published estimates.
#[derive(Debug, Clone)]
pub struct HeartRateSmoother {
    history: HeartRateHistory<HEART_RATE_HISTORY_LEN>,
    max_deviation: f64,
    history_weight: f64,
    default_bpm: f64,
}

impl HeartRateSmoother {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            history: HeartRateHistory::new(),
            max_deviation: config.max_deviation,
            history_weight: config.history_weight.clamp(0.0, 1.0),
            default_bpm: config.default_bpm,
        }
    }

    /// Publishes a rate for this cycle.
    ///
    /// With a raw rate the value is clamped around the history average and
    /// blended with it before entering the history. Without one the history
    /// average (or the default) is reported and the history stays untouched.
    pub fn publish(&mut self, raw_bpm: Option<f64>) -> HeartRateEstimate {
        let Some(raw) = raw_bpm else {
            return HeartRateEstimate {
                bpm: self.history.average().unwrap_or(self.default_bpm),
                confidence: Confidence::Fallback,
            };
        };

        let bpm = match self.history.average() {
            Some(avg) => {
                let lo = avg * (1.0 - self.max_deviation);
                let hi = avg * (1.0 + self.max_deviation);
                let clamped = raw.clamp(lo.min(hi), hi.max(lo));
                self.history_weight * avg + (1.0 - self.history_weight) * clamped
            }
            None => raw,
        };
        self.history.push(bpm);

        HeartRateEstimate {
            bpm,
            confidence: Confidence::High,
        }
    }

    pub fn history(&self) -> &HeartRateHistory<HEART_RATE_HISTORY_LEN> {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}
