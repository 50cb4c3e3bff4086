//! Constants used throughout the Bluetooth layer
//! GATT layout of the DECG sensor and the advertising name it uses.

use uuid::Uuid;

/// Advertised names of DECG sensors start with this prefix
pub const DEVICE_NAME_PREFIX: &str = "DECG";

/// Service holding the control and info characteristics
pub const UUID_PRIMARY_SERVICE: Uuid = Uuid::from_u128(0x6e40ffe0_b5a3_f393_e0a9_e50e24dcca9e);

/// Service holding the ECG data characteristic
pub const UUID_DATA_SERVICE: Uuid = Uuid::from_u128(0x6e40ffe1_b5a3_f393_e0a9_e50e24dcca9e);

/// Receives control frames from the host
pub const UUID_CONTROL_CHAR: Uuid = Uuid::from_u128(0x6e402a37_b5a3_f393_e0a9_e50e24dcca9e);

/// Notifies replies that are not ECG data
pub const UUID_INFO_CHAR: Uuid = Uuid::from_u128(0x6e402a38_b5a3_f393_e0a9_e50e24dcca9e);

/// Notifies batches of 10-byte ECG records
pub const UUID_DATA_CHAR: Uuid = Uuid::from_u128(0x6e402a39_b5a3_f393_e0a9_e50e24dcca9e);
