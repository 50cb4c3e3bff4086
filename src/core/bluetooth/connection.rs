//! Bluetooth connection handling for DECG sensors
//! One connection attempt per request, then resolution of the two services
//! and three characteristics the sensor exposes.

use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, Device, Service, Uuid};
use log::{debug, info};

use crate::core::bluetooth::commands::CommandSender;
use crate::core::bluetooth::constants::{
    UUID_CONTROL_CHAR, UUID_DATA_CHAR, UUID_DATA_SERVICE, UUID_INFO_CHAR, UUID_PRIMARY_SERVICE,
};
use crate::core::bluetooth::types::ConnectedDeviceState;
use crate::core::codec::ControlCommand;

#[derive(Clone)]
pub struct ConnectionManager {
    adapter: Adapter,
    connect_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(adapter: Adapter, connect_timeout: Duration) -> Self {
        Self {
            adapter,
            connect_timeout,
        }
    }

    /// Establishes the radio link. No retry: a failure is final for this request.
    pub async fn connect(&self, device: &Device) -> Result<()> {
        let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
        info!("Device details - ID: {}, Name: {:?}", device.id(), name);

        if device.is_connected().await {
            info!("Device already connected at the OS level.");
            return Ok(());
        }

        info!("Initiating connection to {}...", device.id());
        tokio::time::timeout(self.connect_timeout, self.adapter.connect_device(device))
            .await
            .map_err(|_| anyhow!("Connection timed out after {:?}", self.connect_timeout))??;
        info!("Connection established");
        Ok(())
    }

    /// Resolves the control, info and data characteristics.
    pub async fn discover(&self, device: &Device) -> Result<ConnectedDeviceState> {
        info!("Discovering services...");
        let services = device.services().await?;
        for service in &services {
            debug!("Available service: {}", service.uuid());
        }

        let primary = find_service(&services, UUID_PRIMARY_SERVICE)?;
        let data = find_service(&services, UUID_DATA_SERVICE)?;

        let primary_chars = primary.characteristics().await?;
        let data_chars = data.characteristics().await?;

        let state = ConnectedDeviceState {
            device: device.clone(),
            control_characteristic: find_characteristic(&primary_chars, UUID_CONTROL_CHAR)?,
            info_characteristic: find_characteristic(&primary_chars, UUID_INFO_CHAR)?,
            data_characteristic: find_characteristic(&data_chars, UUID_DATA_CHAR)?,
        };
        info!("All characteristics resolved");
        Ok(state)
    }

    pub async fn disconnect(&self, device: &Device) -> Result<()> {
        if device.is_connected().await {
            info!("Disconnecting from device {}", device.id());
            self.adapter.disconnect_device(device).await?;
            info!("Successfully disconnected");
        } else {
            info!("Device {} not connected", device.id());
        }
        Ok(())
    }
}

fn find_service(services: &[Service], uuid: Uuid) -> Result<Service> {
    services
        .iter()
        .find(|s| s.uuid() == uuid)
        .cloned()
        .ok_or_else(|| anyhow!("Service not found: {}", uuid))
}

fn find_characteristic(characteristics: &[Characteristic], uuid: Uuid) -> Result<Characteristic> {
    let found = characteristics
        .iter()
        .find(|c| c.uuid() == uuid)
        .cloned()
        .ok_or_else(|| anyhow!("Characteristic not found: {}", uuid))?;
    info!("Found characteristic: {}", uuid);
    Ok(found)
}

/// Writes control frames to the resolved control characteristic
#[derive(Clone)]
pub struct BluestCommandSender {
    control_char: Characteristic,
}

impl BluestCommandSender {
    pub fn new(control_char: Characteristic) -> Self {
        Self { control_char }
    }
}

#[async_trait::async_trait]
impl CommandSender for BluestCommandSender {
    async fn send_command(&self, command: ControlCommand) -> Result<()> {
        let data = command.to_bytes();
        self.control_char.write(&data).await?;
        Ok(())
    }
}
