//! Device discovery
//! Scans for advertising DECG sensors and reports each one once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use anyhow::Result;
use bluest::{Adapter, Device};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::device_config::DeviceConfig;
use crate::core::bluetooth::state_machine::{ConnectionEvent, ConnectionState, ConnectionStateMachine};
use crate::core::bluetooth::types::BluetoothDevice;
use crate::core::events::{CoreEvent, EventEmitter};

/// Outcome of offering an advertisement to a `DiscoveryFilter`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting of a matching device. `limit_reached` asks the scan to stop.
    Accepted { limit_reached: bool },
    Duplicate,
    NameMismatch,
    /// The cap was already reached.
    Full,
}

/// Prefix match, dedupe by id and a cap on distinct devices
#[derive(Debug, Clone)]
pub struct DiscoveryFilter {
    name_prefix: String,
    max_devices: usize,
    seen: HashSet<String>,
}

impl DiscoveryFilter {
    pub fn new(name_prefix: impl Into<String>, max_devices: usize) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            max_devices: max_devices.max(1),
            seen: HashSet::new(),
        }
    }

    pub fn offer(&mut self, id: &str, name: Option<&str>) -> Admission {
        let matches = name.is_some_and(|n| n.starts_with(&self.name_prefix));
        if !matches {
            return Admission::NameMismatch;
        }
        if self.seen.contains(id) {
            return Admission::Duplicate;
        }
        if self.seen.len() >= self.max_devices {
            return Admission::Full;
        }
        self.seen.insert(id.to_string());
        Admission::Accepted {
            limit_reached: self.seen.len() >= self.max_devices,
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

static MAC_ADDRESS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok());

/// Pulls the trailing MAC address out of a platform device id, if present.
pub fn extract_mac_address(device_id: &str) -> Option<String> {
    MAC_ADDRESS
        .as_ref()?
        .find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}

pub struct BluetoothScanner {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<String, Device>>>,
    state_machine: ConnectionStateMachine,
    emitter: EventEmitter,
    config: DeviceConfig,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl BluetoothScanner {
    pub fn new(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        state_machine: ConnectionStateMachine,
        emitter: EventEmitter,
        config: DeviceConfig,
    ) -> Self {
        Self {
            adapter,
            devices,
            state_machine,
            emitter,
            config,
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    /// Starts a background scan. A no-op while a scan is running or the radio is off.
    pub async fn start_scan(&mut self) -> Result<()> {
        if self.state_machine.state() == ConnectionState::Scanning {
            info!("Scan already in progress.");
            return Ok(());
        }
        if !self.adapter.is_available().await.unwrap_or(false) {
            warn!("Bluetooth adapter is not available, not scanning.");
            return Ok(());
        }
        if !self.state_machine.begin_scan() {
            warn!("Cannot scan while {:?}", self.state_machine.state());
            return Ok(());
        }

        lock_devices(&self.devices).clear();
        self.cancel_token = CancellationToken::new();

        let handle = tokio::spawn(Self::internal_scan_task(
            self.adapter.clone(),
            self.devices.clone(),
            self.state_machine.clone(),
            self.emitter.clone(),
            self.config.clone(),
            self.cancel_token.clone(),
        ));
        self.scan_task_handle = Some(handle);

        self.emitter.emit(CoreEvent::ScanStarted);
        info!("Device scan task started.");
        Ok(())
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<String, Device>>>,
        state_machine: ConnectionStateMachine,
        emitter: EventEmitter,
        config: DeviceConfig,
        cancel_token: CancellationToken,
    ) {
        let mut filter = DiscoveryFilter::new(config.name_prefix.clone(), config.max_scanned_devices);

        let outcome = Self::scan_until_done(
            &adapter,
            &devices,
            &emitter,
            &mut filter,
            config.scan_duration(),
            &cancel_token,
        )
        .await;

        // A device may have been selected meanwhile; only a live scan is closed here.
        let still_scanning = state_machine.state() == ConnectionState::Scanning;
        match outcome {
            Ok(()) => {
                info!("Scan finished with {} device(s).", filter.len());
                if still_scanning {
                    state_machine.apply(ConnectionEvent::ScanStopped);
                }
            }
            Err(e) => {
                error!("Bluetooth scan failed: {}", e);
                if still_scanning {
                    state_machine.apply(ConnectionEvent::ScanFailed(e.to_string()));
                }
            }
        }
        emitter.emit(CoreEvent::ScanComplete);
    }

    async fn scan_until_done(
        adapter: &Adapter,
        devices: &Arc<Mutex<HashMap<String, Device>>>,
        emitter: &EventEmitter,
        filter: &mut DiscoveryFilter,
        scan_duration: Duration,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        // Devices the OS already holds a link to never advertise.
        info!("Checking for connected devices");
        for device in adapter.connected_devices().await? {
            let id = device.id().to_string();
            let name = device.name().ok();
            if let Admission::Accepted { limit_reached } = filter.offer(&id, name.as_deref()) {
                Self::report_device(devices, emitter, device, None, true);
                if limit_reached {
                    return Ok(());
                }
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;
        let deadline = tokio::time::sleep(scan_duration);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(discovered) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let device = discovered.device;
                    let id = device.id().to_string();
                    let name = device.name().ok();
                    debug!("Advertisement from {} ({:?}), RSSI {:?}", id, name, discovered.rssi);

                    match filter.offer(&id, name.as_deref()) {
                        Admission::Accepted { limit_reached } => {
                            Self::report_device(devices, emitter, device, discovered.rssi, false);
                            if limit_reached {
                                info!("Device limit reached, stopping scan early.");
                                break;
                            }
                        }
                        Admission::Full => break,
                        Admission::Duplicate | Admission::NameMismatch => {}
                    }
                }
                _ = &mut deadline => {
                    info!("Scan duration of {:?} elapsed.", scan_duration);
                    break;
                }
                _ = cancel_token.cancelled() => {
                    info!("Scan cancelled.");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Signals the scan task to stop and waits for it to finish.
    pub async fn stop_scan(&mut self) -> Result<()> {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            if let Err(e) = handle.await {
                if e.is_cancelled() {
                    info!("Scan task was cancelled.");
                } else {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        } else {
            debug!("No active scan task handle found to wait for.");
        }
        Ok(())
    }

    fn report_device(
        devices: &Arc<Mutex<HashMap<String, Device>>>,
        emitter: &EventEmitter,
        device: Device,
        rssi: Option<i16>,
        is_connected: bool,
    ) {
        let id = device.id().to_string();
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        let address = extract_mac_address(&id).unwrap_or_else(|| "N/A".to_string());
        let info = BluetoothDevice::new(id.clone(), name, address, rssi, is_connected);
        info!(
            "Found sensor - Address: {}, ID: {}, Name: {:?}, RSSI: {:?}, Connected: {}",
            info.address, info.id, info.name, info.rssi, info.is_connected
        );

        lock_devices(devices).insert(id, device);

        emitter.emit(CoreEvent::DeviceDiscovered {
            id: info.id,
            name: info.name,
            address: info.address,
            rssi: info.rssi,
        });
    }
}

fn lock_devices(
    devices: &Arc<Mutex<HashMap<String, Device>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, Device>> {
    devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
