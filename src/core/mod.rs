//! Core functionality for the DECG Monitor Bridge
//! Wire codec, sampling window, signal processing, acquisition orchestration
//! and the Bluetooth layer that feeds them.

pub mod bluetooth;
pub mod codec;
pub mod events;
pub mod orchestrator;
pub mod processor;
pub mod window;

// Re-export commonly used types
pub use bluetooth::{BluetoothManager, ConnectionState};
pub use codec::{ControlCommand, EcgSample, StartTime};
pub use events::{CoreEvent, EventEmitter, Metric};
pub use orchestrator::{AcquisitionHandle, Orchestrator};
pub use processor::{Confidence, HeartRateEstimate, HrvFrequencyMetrics, HrvMetrics, SignalProcessor};
pub use window::{Lead, SamplingWindow};
