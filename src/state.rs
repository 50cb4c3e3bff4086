//! Session context
//! Everything a running bridge shares, built once at startup and handed to
//! each command. There is no global state.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{error, info};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::bluetooth::{BluetoothManager, SessionFlags};
use crate::core::events::EventEmitter;
use crate::core::orchestrator::{AcquisitionHandle, Orchestrator};

pub struct SessionContext {
    /// The Bluetooth manager instance
    pub bluetooth_manager: Arc<AsyncMutex<BluetoothManager>>,
    pub acquisition: AcquisitionHandle,
    pub flags: Arc<Mutex<SessionFlags>>,
    pub config: AppConfig,
    /// Cancelling this stops the acquisition task.
    pub shutdown_token: CancellationToken,
    acquisition_task: JoinHandle<()>,
}

impl SessionContext {
    /// Spawns the acquisition task and binds to the default Bluetooth adapter.
    pub async fn new(config: AppConfig, emitter: EventEmitter) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let (acquisition, acquisition_task) = Orchestrator::spawn(
            &config.acquisition,
            &config.signal,
            emitter.clone(),
            shutdown.clone(),
        );

        info!("Initializing BluetoothManager...");
        let flags = Arc::new(Mutex::new(SessionFlags::default()));
        let manager = match BluetoothManager::new(
            config.device.clone(),
            emitter,
            acquisition.clone(),
            flags.clone(),
        )
        .await
        {
            Ok(manager) => manager,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        };

        Ok(Self {
            bluetooth_manager: Arc::new(AsyncMutex::new(manager)),
            acquisition,
            flags,
            config,
            shutdown_token: shutdown,
            acquisition_task,
        })
    }

    /// Current session flags.
    pub fn session_flags(&self) -> SessionFlags {
        self.flags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update_flags<F: FnOnce(&mut SessionFlags)>(&self, update: F) {
        let mut flags = self.flags.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        update(&mut flags);
    }

    /// Stops the acquisition task and waits for it.
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        if let Err(e) = self.acquisition_task.await {
            error!("Acquisition task ended abnormally: {:?}", e);
        }
    }
}
