//! Sampling window for the selected ECG lead
//! A bounded FIFO that keeps the most recent samples of one lead for the detector.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::codec::EcgSample;
use crate::core::processor::remove_dc;

/// Five seconds at 200 Hz
pub const DEFAULT_WINDOW_CAPACITY: usize = 1000;
/// Number of samples evicted at once when the window overflows
pub const DEFAULT_EVICTION_BATCH: usize = 8;

/// One of the three simultaneous ECG channels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lead {
    #[default]
    Ecg1,
    Ecg2,
    Ecg3,
}

impl Lead {
    /// Picks this lead's value out of a three-lead record
    pub fn select(self, sample: &EcgSample) -> i32 {
        match self {
            Lead::Ecg1 => sample.ecg1,
            Lead::Ecg2 => sample.ecg2,
            Lead::Ecg3 => sample.ecg3,
        }
    }
}

/// Bounded window of raw samples from a single lead.
///
/// The window has exactly one writer. Readers get owned copies through [`snapshot`],
/// so a detection cycle never observes a half-evicted buffer.
///
/// [`snapshot`]: SamplingWindow::snapshot
#[derive(Debug, Clone)]
pub struct SamplingWindow {
    samples: VecDeque<i32>,
    capacity: usize,
    eviction_batch: usize,
    lead: Lead,
}

impl SamplingWindow {
    pub fn new(capacity: usize, eviction_batch: usize, lead: Lead) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity + 1),
            capacity,
            eviction_batch: eviction_batch.max(1),
            lead,
        }
    }

    /// Appends one value, evicting the oldest samples in whole batches once over capacity
    pub fn append(&mut self, value: i32) {
        self.samples.push_back(value);
        while self.samples.len() > self.capacity {
            let count = self.eviction_batch.min(self.samples.len());
            self.samples.drain(..count);
        }
    }

    /// Appends the currently selected lead of a decoded record
    pub fn append_sample(&mut self, sample: &EcgSample) {
        self.append(self.lead.select(sample));
    }

    /// Selects another lead. History from the old lead is discarded.
    pub fn switch_lead(&mut self, lead: Lead) {
        self.samples.clear();
        self.lead = lead;
    }

    /// Owned copy of the window contents, oldest first
    pub fn snapshot(&self) -> Vec<i32> {
        self.samples.iter().copied().collect()
    }

    /// Copy of the window with the mean removed and scaled by the device calibration divisor
    pub fn filtered_snapshot(&self, calibration_divisor: f64) -> Vec<f64> {
        remove_dc(&self.snapshot(), calibration_divisor)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn lead(&self) -> Lead {
        self.lead
    }
}

impl Default for SamplingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY, DEFAULT_EVICTION_BATCH, Lead::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity() {
        let mut window = SamplingWindow::new(100, 8, Lead::Ecg1);
        for value in 0..1_000 {
            window.append(value);
            assert!(window.len() <= window.capacity());
        }
    }

    #[test]
    fn evicts_oldest_in_batches() {
        let mut window = SamplingWindow::default();
        for value in 0..1_000 {
            window.append(value);
        }
        assert_eq!(window.len(), 1_000);

        window.append(1_000);
        assert_eq!(window.len(), 993);
        let snapshot = window.snapshot();
        assert_eq!(snapshot.first(), Some(&8));
        assert_eq!(snapshot.last(), Some(&1_000));
    }

    #[test]
    fn batch_larger_than_capacity_still_bounds_window() {
        let mut window = SamplingWindow::new(3, 8, Lead::Ecg1);
        for value in 0..4 {
            window.append(value);
        }
        assert!(window.is_empty());
        window.append(9);
        assert_eq!(window.snapshot(), vec![9]);
    }

    #[test]
    fn switching_lead_clears_history() {
        let sample = EcgSample {
            status_flags: 0,
            ecg1: 1,
            ecg2: 2,
            ecg3: 3,
        };
        let mut window = SamplingWindow::default();
        window.append_sample(&sample);
        window.append_sample(&sample);
        assert_eq!(window.snapshot(), vec![1, 1]);

        window.switch_lead(Lead::Ecg3);
        assert!(window.is_empty());
        window.append_sample(&sample);
        assert_eq!(window.snapshot(), vec![3]);
        assert_eq!(window.lead(), Lead::Ecg3);
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut window = SamplingWindow::new(4, 2, Lead::Ecg1);
        window.append(10);
        window.append(20);
        let snapshot = window.snapshot();
        for value in 0..10 {
            window.append(value);
        }
        assert_eq!(snapshot, vec![10, 20]);
    }

    #[test]
    fn filtered_snapshot_removes_mean() {
        let mut window = SamplingWindow::default();
        window.append(10);
        window.append(30);
        assert_eq!(window.filtered_snapshot(10.0), vec![-1.0, 1.0]);
    }
}
