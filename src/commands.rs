//! Operator commands
//! This module defines every command a front end can issue to a running
//! session and routes it to the Bluetooth manager or the acquisition task.

use log::info;
use serde::{Deserialize, Serialize};

use crate::core::codec::{CollectionStart, ControlCommand, StartTime};
use crate::core::events::Metric;
use crate::core::window::Lead;
use crate::state::SessionContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserCommand {
    StartScan,
    StopScan,
    /// Connects to a device reported by the last scan, by id.
    Connect(String),
    Disconnect,
    StartCollecting,
    StopCollecting,
    StartTransferring,
    StopTransferring,
    SetLead(Lead),
    SetActiveMetric(Metric),
}

/// Runs `command` against the session. Errors come back as display strings.
pub async fn dispatch(ctx: &SessionContext, command: UserCommand) -> Result<(), String> {
    info!("Command: {:?}", command);
    match command {
        UserCommand::StartScan => start_scan(ctx).await,
        UserCommand::StopScan => stop_scan(ctx).await,
        UserCommand::Connect(device_id) => connect_to_device(ctx, &device_id).await,
        UserCommand::Disconnect => disconnect(ctx).await,
        UserCommand::StartCollecting => start_collecting(ctx).await,
        UserCommand::StopCollecting => stop_collecting(ctx).await,
        UserCommand::StartTransferring => start_transferring(ctx).await,
        UserCommand::StopTransferring => stop_transferring(ctx).await,
        UserCommand::SetLead(lead) => {
            ctx.acquisition.set_lead(lead);
            Ok(())
        }
        UserCommand::SetActiveMetric(metric) => {
            ctx.acquisition.set_active_metric(metric);
            Ok(())
        }
    }
}

pub async fn start_scan(ctx: &SessionContext) -> Result<(), String> {
    let mut bluetooth_manager_guard = ctx.bluetooth_manager.lock().await;
    bluetooth_manager_guard.start_scan().await.map_err(|e| e.to_string())
}

pub async fn stop_scan(ctx: &SessionContext) -> Result<(), String> {
    let mut bluetooth_manager_guard = ctx.bluetooth_manager.lock().await;
    bluetooth_manager_guard.stop_scan().await.map_err(|e| e.to_string())
}

pub async fn connect_to_device(ctx: &SessionContext, device_id: &str) -> Result<(), String> {
    let mut bluetooth_manager_guard = ctx.bluetooth_manager.lock().await;
    bluetooth_manager_guard
        .connect_device(device_id)
        .await
        .map_err(|e| e.to_string())
}

/// Disconnects from the current device. Stops detection first so nothing
/// is published for the closing session.
pub async fn disconnect(ctx: &SessionContext) -> Result<(), String> {
    ctx.acquisition.stop();
    let mut bluetooth_manager_guard = ctx.bluetooth_manager.lock().await;
    bluetooth_manager_guard.disconnect().await.map_err(|e| e.to_string())
}

async fn send(ctx: &SessionContext, command: ControlCommand) -> Result<(), String> {
    let bluetooth_manager_guard = ctx.bluetooth_manager.lock().await;
    if bluetooth_manager_guard.send_command(command).await {
        Ok(())
    } else {
        Err(format!("{:?} was not sent", command))
    }
}

/// Starts on-device collection stamped with the current local time.
pub async fn start_collecting(ctx: &SessionContext) -> Result<(), String> {
    let started_at = StartTime::now_local();
    send(ctx, ControlCommand::StartCollection(CollectionStart::At(started_at))).await?;
    ctx.update_flags(|flags| {
        flags.is_collecting = true;
        flags.collection_started_at = Some(started_at);
    });
    Ok(())
}

pub async fn stop_collecting(ctx: &SessionContext) -> Result<(), String> {
    send(ctx, ControlCommand::StopCollection).await?;
    ctx.update_flags(|flags| {
        flags.is_collecting = false;
        flags.collection_started_at = None;
    });
    Ok(())
}

/// Starts streaming samples and the detection cycle that consumes them.
pub async fn start_transferring(ctx: &SessionContext) -> Result<(), String> {
    send(ctx, ControlCommand::StartTransfer).await?;
    let device_id = ctx.bluetooth_manager.lock().await.connected_device_id();
    ctx.update_flags(|flags| {
        flags.is_transferring = true;
        flags.device_id = device_id;
    });
    ctx.acquisition.start();
    Ok(())
}

pub async fn stop_transferring(ctx: &SessionContext) -> Result<(), String> {
    ctx.acquisition.stop();
    send(ctx, ControlCommand::StopTransfer).await?;
    ctx.update_flags(|flags| flags.is_transferring = false);
    Ok(())
}
