use std::path::PathBuf;

use anyhow::{Result, anyhow};
use decg_monitor_bridge_lib::commands::{UserCommand, dispatch};
use decg_monitor_bridge_lib::config::AppConfig;
use decg_monitor_bridge_lib::core::events::{self, CoreEvent};
use decg_monitor_bridge_lib::logging;
use decg_monitor_bridge_lib::state::SessionContext;
use log::{LevelFilter, debug, error, info, warn};

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::ConnectionStateChanged(state) => info!("Status: {}", state.label()),
        CoreEvent::HeartRate(estimate) => {
            info!("Heart rate: {:.1} bpm ({:?})", estimate.bpm, estimate.confidence)
        }
        CoreEvent::HrvMetrics(hrv) => info!(
            "HRV: SDNN {:.1} ms, RMSSD {:.1} ms, pNN50 {:.0}%",
            hrv.sdnn * 1000.0,
            hrv.rmssd * 1000.0,
            hrv.pnn50 * 100.0
        ),
        CoreEvent::HrvFrequency(bands) => info!(
            "HRV spectrum: LF {:.4}, HF {:.4}, LF/HF {}",
            bands.lf,
            bands.hf,
            bands
                .lf_hf_ratio
                .map_or_else(|| "n/a".to_string(), |ratio| format!("{:.2}", ratio))
        ),
        CoreEvent::Metric(reading) => info!("{:?}: {:.1}", reading.metric, reading.value),
        CoreEvent::RawSampleBatch(samples) => debug!("Received {} samples", samples.len()),
        other => match serde_json::to_string(other) {
            Ok(json) => debug!("Event: {}", json),
            Err(e) => error!("Failed to serialize event: {}", e),
        },
    }
}

async fn run(ctx: &SessionContext, events: &mut tokio::sync::mpsc::UnboundedReceiver<CoreEvent>) -> Result<()> {
    dispatch(ctx, UserCommand::StartScan).await.map_err(|e| anyhow!(e))?;

    let device_id = loop {
        match events.recv().await {
            Some(CoreEvent::DeviceDiscovered { id, name, address, rssi }) => {
                info!("Selecting {} ({}, {}, RSSI {:?})", name, id, address, rssi);
                break Some(id);
            }
            Some(CoreEvent::ScanComplete) | None => break None,
            Some(other) => log_event(&other),
        }
    };
    let Some(device_id) = device_id else {
        warn!("No DECG sensor found");
        return Ok(());
    };

    dispatch(ctx, UserCommand::Connect(device_id)).await.map_err(|e| anyhow!(e))?;
    for command in [UserCommand::StartCollecting, UserCommand::StartTransferring] {
        if let Err(e) = dispatch(ctx, command).await {
            warn!("{}", e);
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => log_event(&event),
                    None => break,
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    let flags = ctx.session_flags();
    debug!("Shutting down with {:?}", flags);
    let mut commands = Vec::new();
    if flags.is_transferring {
        commands.push(UserCommand::StopTransferring);
    }
    commands.push(UserCommand::Disconnect);
    for command in commands {
        if let Err(e) = dispatch(ctx, command).await {
            warn!("{}", e);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(LevelFilter::Info);

    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config"));
    let config = AppConfig::load(&config_dir).await?;

    let (emitter, mut events) = events::channel();
    let ctx = SessionContext::new(config, emitter).await?;

    let result = run(&ctx, &mut events).await;
    if let Err(e) = &result {
        error!("{}", e);
    }
    ctx.shutdown().await;
    result
}
