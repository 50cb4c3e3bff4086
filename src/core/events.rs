//! Events published by the core to whoever drives it (the CLI runner or tests)

use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::bluetooth::state_machine::ConnectionState;
use crate::core::codec::EcgSample;
use crate::core::processor::{HeartRateEstimate, HrvFrequencyMetrics, HrvMetrics};

/// Metric surfaced through `CoreEvent::Metric` after each detection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    /// Smoothed heart rate (bpm).
    #[default]
    HeartRate,
    /// Heart rate from the mean RR interval (bpm).
    MeanHr,
    /// RMSSD in milliseconds.
    Rmssd,
    /// SDNN in milliseconds.
    Sdnn,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricReading {
    pub metric: Metric,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    ConnectionStateChanged(ConnectionState),
    ScanStarted,
    DeviceDiscovered {
        id: String,
        name: String,
        address: String,
        rssi: Option<i16>,
    },
    ScanComplete,
    HeartRate(HeartRateEstimate),
    HrvMetrics(HrvMetrics),
    /// Band powers of the resampled RR tachogram.
    HrvFrequency(HrvFrequencyMetrics),
    Metric(MetricReading),
    /// Samples of every accepted notification, all three leads.
    RawSampleBatch(Vec<EcgSample>),
    /// Raw payload received on the info characteristic.
    InfoNotification(Vec<u8>),
}

/// Cloneable handle used by every component to publish `CoreEvent`s.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<CoreEvent>,
}

impl EventEmitter {
    pub fn new(sender: mpsc::UnboundedSender<CoreEvent>) -> Self {
        Self { sender }
    }

    pub fn emit(&self, event: CoreEvent) {
        if let Err(e) = self.sender.send(event) {
            debug!("Dropping event, no receiver: {:?}", e.0);
        }
    }
}

/// Creates an emitter together with the receiving end of its channel.
pub fn channel() -> (EventEmitter, mpsc::UnboundedReceiver<CoreEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::processor::Confidence;

    #[tokio::test]
    async fn emitted_events_reach_receiver_in_order() {
        let (emitter, mut rx) = channel();
        emitter.emit(CoreEvent::ScanStarted);
        emitter.clone().emit(CoreEvent::ScanComplete);
        assert_eq!(rx.recv().await, Some(CoreEvent::ScanStarted));
        assert_eq!(rx.recv().await, Some(CoreEvent::ScanComplete));
    }

    #[test]
    fn emit_without_receiver_does_not_panic() {
        let (emitter, rx) = channel();
        drop(rx);
        emitter.emit(CoreEvent::ScanStarted);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&CoreEvent::HeartRate(HeartRateEstimate {
            bpm: 72.0,
            confidence: Confidence::High,
        }))
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"HeartRate","payload":{"bpm":72.0,"confidence":"High"}}"#
        );
    }
}
