//! Bluetooth manager for the DECG Monitor Bridge
//! This module provides the main interface for radio operations and carries
//! out the effects requested by the connection state machine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use bluest::{Adapter, ConnectionEvent as RadioEvent, Device};
use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::task::JoinHandle;

use crate::config::device_config::DeviceConfig;
use crate::core::bluetooth::commands::CommandExecutor;
use crate::core::bluetooth::connection::{BluestCommandSender, ConnectionManager};
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::state_machine::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, Effect,
};
use crate::core::bluetooth::types::ConnectedDeviceState;
use crate::core::codec::{ControlCommand, StartTime};
use crate::core::events::EventEmitter;
use crate::core::orchestrator::AcquisitionHandle;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the operator asked the sensor to do, kept for the app's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFlags {
    pub is_collecting: bool,
    pub is_transferring: bool,
    pub collection_started_at: Option<StartTime>,
    /// Sensor the transfer was started on
    pub device_id: Option<String>,
}

/// The live connection state together with the resources tied to it.
///
/// Teardown effects (`ClearHandles`, `NotifyDisconnect`) are run here so that
/// every path into `Disconnected` or `Failed` releases the same things.
pub struct SessionLink<H> {
    state_machine: ConnectionStateMachine,
    acquisition: AcquisitionHandle,
    handles: Arc<Mutex<Option<H>>>,
}

impl<H> Clone for SessionLink<H> {
    fn clone(&self) -> Self {
        Self {
            state_machine: self.state_machine.clone(),
            acquisition: self.acquisition.clone(),
            handles: self.handles.clone(),
        }
    }
}

impl<H: Clone> SessionLink<H> {
    pub fn new(state_machine: ConnectionStateMachine, acquisition: AcquisitionHandle) -> Self {
        Self {
            state_machine,
            acquisition,
            handles: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_machine.state()
    }

    pub fn handles(&self) -> Option<H> {
        lock(&self.handles).clone()
    }

    /// Applies `event`, runs teardown effects and returns the remaining ones.
    /// Teardown finishes before the new state is published, so nothing from
    /// the old session is emitted after a `Disconnected` state change.
    pub fn apply(&self, event: ConnectionEvent) -> Vec<Effect> {
        self.state_machine.apply_with(event, |effects| {
            let mut remaining = Vec::new();
            for effect in effects {
                match effect {
                    Effect::ClearHandles => {
                        if lock(&self.handles).take().is_some() {
                            info!("Characteristic handles released");
                        }
                    }
                    Effect::NotifyDisconnect => self.acquisition.end_session(),
                    other => remaining.push(other),
                }
            }
            remaining
        })
    }

    /// Moves to `Ready` with `handles` installed and opens an acquisition
    /// session. Returns the session and the effects to run, or `None` if the
    /// link is no longer discovering services.
    ///
    /// Handles and session are in place before `Ready` is published, and a
    /// concurrent teardown either runs before the transition or after it.
    pub fn resolve(&self, handles: H) -> Option<(u64, Vec<Effect>)> {
        let mut session = None;
        let effects = self
            .state_machine
            .apply_with(ConnectionEvent::ServicesResolved, |effects| {
                if effects.contains(&Effect::EnableNotifications) {
                    *lock(&self.handles) = Some(handles);
                    session = Some(self.acquisition.begin_session());
                }
                effects
            });
        session.map(|session| (session, effects))
    }
}

/// Manages Bluetooth operations
pub struct BluetoothManager {
    adapter: Adapter,
    /// Devices reported by the last scan, by id
    devices: Arc<Mutex<HashMap<String, Device>>>,
    link: SessionLink<ConnectedDeviceState>,
    connection_manager: ConnectionManager,
    scanner: BluetoothScanner,
    notification_handler: NotificationHandler,
    emitter: EventEmitter,
    acquisition: AcquisitionHandle,
    flags: Arc<Mutex<SessionFlags>>,
    config: DeviceConfig,
    disconnect_watcher: Option<JoinHandle<()>>,
}

impl BluetoothManager {
    /// Creates a new BluetoothManager bound to the default adapter.
    pub async fn new(
        config: DeviceConfig,
        emitter: EventEmitter,
        acquisition: AcquisitionHandle,
        flags: Arc<Mutex<SessionFlags>>,
    ) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let devices = Arc::new(Mutex::new(HashMap::new()));
        let state_machine = ConnectionStateMachine::new(emitter.clone());
        let scanner = BluetoothScanner::new(
            adapter.clone(),
            devices.clone(),
            state_machine.clone(),
            emitter.clone(),
            config.clone(),
        );

        Ok(Self {
            connection_manager: ConnectionManager::new(adapter.clone(), config.connect_timeout()),
            link: SessionLink::new(state_machine, acquisition.clone()),
            adapter,
            devices,
            scanner,
            notification_handler: NotificationHandler::new(),
            emitter,
            acquisition,
            flags,
            config,
            disconnect_watcher: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub async fn start_scan(&mut self) -> Result<()> {
        self.scanner.start_scan().await
    }

    pub async fn stop_scan(&mut self) -> Result<()> {
        self.scanner.stop_scan().await
    }

    /// Connects to a device reported by the last scan and brings the link to `Ready`.
    pub async fn connect_device(&mut self, device_id: &str) -> Result<()> {
        let device = lock(&self.devices)
            .get(device_id)
            .cloned()
            .ok_or_else(|| anyhow!("Device not found with ID: {}", device_id))?;

        let effects = self.link.apply(ConnectionEvent::DeviceSelected(device_id.to_string()));
        if self.state() != ConnectionState::Connecting {
            return Err(anyhow!("Cannot connect while {:?}", self.state()));
        }
        if effects.contains(&Effect::StopScan) {
            self.scanner.stop_scan().await?;
        }

        if let Err(e) = self.connection_manager.connect(&device).await {
            error!("Connection to {} failed: {}", device_id, e);
            self.link.apply(ConnectionEvent::ConnectFailed(e.to_string()));
            return Err(e);
        }

        let effects = self.link.apply(ConnectionEvent::Connected);
        if !effects.contains(&Effect::DiscoverServices) {
            return Err(anyhow!("Link left Connecting before the device answered"));
        }

        let handles = match self.connection_manager.discover(&device).await {
            Ok(handles) => handles,
            Err(e) => {
                error!("Service discovery failed: {}", e);
                self.link.apply(ConnectionEvent::DiscoveryFailed(e.to_string()));
                if let Err(e) = self.connection_manager.disconnect(&device).await {
                    warn!("Failed to drop half-open link: {}", e);
                }
                return Err(e);
            }
        };

        let Some((session, effects)) = self.link.resolve(handles.clone()) else {
            return Err(anyhow!("Link was lost during service discovery"));
        };
        if effects.contains(&Effect::EnableNotifications) {
            self.notification_handler.setup_notifications(
                &handles,
                session,
                self.acquisition.clone(),
                self.emitter.clone(),
            );
        }
        self.spawn_disconnect_watcher(device);

        info!("Device {} ready, session {}", device_id, session);
        self.restore_transfer(device_id).await;
        Ok(())
    }

    /// Watches the radio for a link loss and tears the session down when it happens.
    fn spawn_disconnect_watcher(&mut self, device: Device) {
        if let Some(watcher) = self.disconnect_watcher.take() {
            watcher.abort();
        }
        let adapter = self.adapter.clone();
        let link = self.link.clone();
        let notifications = self.notification_handler.cancel_token();

        self.disconnect_watcher = Some(tokio::spawn(async move {
            let events = match adapter.device_connection_events(&device).await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch connection events: {}", e);
                    return;
                }
            };
            tokio::pin!(events);

            loop {
                tokio::select! {
                    event = events.next() => {
                        match event {
                            Some(RadioEvent::Disconnected) | None => break,
                            Some(_) => continue,
                        }
                    }
                    // Local disconnect handles its own teardown.
                    _ = notifications.cancelled() => return,
                }
            }

            warn!("Device {} lost connection", device.id());
            notifications.cancel();
            link.apply(ConnectionEvent::Disconnected);
        }));
    }

    /// Re-sends StartTransfer when the same sensor comes back while a
    /// transfer was active.
    async fn restore_transfer(&self, device_id: &str) {
        if !self.config.restore_transfer_on_ready {
            return;
        }
        let should_restore = {
            let flags = lock(&self.flags);
            flags.is_transferring && flags.device_id.as_deref() == Some(device_id)
        };
        if should_restore {
            info!("Restoring transfer on {}", device_id);
            if self.send_command(ControlCommand::StartTransfer).await {
                self.acquisition.start();
            }
        }
    }

    /// Sends `command` if the link is `Ready`; dropped with a log entry otherwise.
    pub async fn send_command(&self, command: ControlCommand) -> bool {
        let executor = match self.link.handles() {
            Some(handles) => CommandExecutor::new(BluestCommandSender::new(handles.control_characteristic)),
            None => CommandExecutor::unresolved(),
        };
        executor.send(self.link.state(), command).await
    }

    /// Disconnects from the current device and releases its handles.
    pub async fn disconnect(&mut self) -> Result<()> {
        let handles = self.link.handles();

        self.notification_handler.stop_notifications().await;
        if let Some(watcher) = self.disconnect_watcher.take() {
            watcher.abort();
        }
        self.link.apply(ConnectionEvent::Disconnected);

        match handles {
            Some(handles) => self.connection_manager.disconnect(&handles.device).await,
            None => {
                info!("No device connected");
                Ok(())
            }
        }
    }

    /// Returns the ID of the currently connected device
    pub fn connected_device_id(&self) -> Option<String> {
        self.link.handles().map(|h| h.device.id().to_string())
    }
}
