//! Defines shared data structures for the Bluetooth module.

use bluest::{Characteristic, Device};

/// A sensor reported by a scan
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BluetoothDevice {
    /// Platform-specific unique identifier, used to connect
    pub id: String,
    pub name: String,
    /// MAC address when the platform exposes one in the id, otherwise "N/A"
    pub address: String,
    /// Signal strength of the advertisement, when known
    pub rssi: Option<i16>,
    pub is_connected: bool,
}

impl BluetoothDevice {
    pub fn new(id: String, name: String, address: String, rssi: Option<i16>, is_connected: bool) -> Self {
        Self {
            id,
            name,
            address,
            rssi,
            is_connected,
        }
    }
}

/// Handles resolved during service discovery.
/// Written once on the way to `Ready` and dropped on teardown.
#[derive(Clone)]
pub struct ConnectedDeviceState {
    pub device: Device,
    /// Control frames are written here
    pub control_characteristic: Characteristic,
    /// Non-ECG replies, optional telemetry
    pub info_characteristic: Characteristic,
    /// ECG sample batches
    pub data_characteristic: Characteristic,
}
