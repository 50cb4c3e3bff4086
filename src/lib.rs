//! DECG Monitor Bridge library
//! Streams three-lead ECG from DECG sensors over Bluetooth LE and derives
//! heart rate and HRV in real time.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
