//! Bluetooth functionality for the DECG Monitor Bridge
//! This module handles all radio operations including scanning, connecting,
//! sending control frames and receiving ECG notifications.

pub mod commands;
pub mod connection;
pub mod constants;
pub mod manager;
pub mod notification;
pub mod scanner;
pub mod state_machine;
pub mod types;

pub use commands::{CommandExecutor, CommandSender};
pub use connection::{BluestCommandSender, ConnectionManager};
pub use manager::{BluetoothManager, SessionFlags, SessionLink};
pub use notification::{NotificationHandler, forward_payload};
pub use scanner::{Admission, BluetoothScanner, DiscoveryFilter};
pub use state_machine::{ConnectionEvent, ConnectionState, ConnectionStateMachine, Effect, transition};
pub use types::{BluetoothDevice, ConnectedDeviceState};
