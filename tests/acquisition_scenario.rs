//! Drives a full acquisition session without a radio: discovery, link
//! bring-up, control framing, streaming and heart-rate publication.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use decg_monitor_bridge_lib::config::acquisition_config::AcquisitionConfig;
use decg_monitor_bridge_lib::config::signal_config::SignalConfig;
use decg_monitor_bridge_lib::core::bluetooth::{
    Admission, CommandExecutor, CommandSender, ConnectionEvent, ConnectionState,
    ConnectionStateMachine, DiscoveryFilter, SessionLink, forward_payload,
};
use decg_monitor_bridge_lib::core::codec::{ControlCommand, StartTime};
use decg_monitor_bridge_lib::core::events::{self, CoreEvent};
use decg_monitor_bridge_lib::core::orchestrator::Orchestrator;
use decg_monitor_bridge_lib::core::processor::Confidence;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const RECORDS_PER_NOTIFICATION: usize = 8;

#[derive(Clone, Default)]
struct RecordingSender {
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl CommandSender for RecordingSender {
    async fn send_command(&self, command: ControlCommand) -> Result<()> {
        self.frames.lock().unwrap().push(command.to_bytes());
        Ok(())
    }
}

/// 200 Hz trace with one sharp beat every `period` samples over slow wander.
fn beat_signal(len: usize, period: usize) -> Vec<i32> {
    (0..len)
        .map(|i| {
            let wander = 2_000.0 * (2.0 * PI * 0.3 * i as f64 / 200.0).sin();
            let offset = (i + period / 2) % period;
            let spike = match offset.min(period - offset) {
                0 => 60_000.0,
                1 => 30_000.0,
                2 => 7_500.0,
                _ => 0.0,
            };
            (wander + spike) as i32
        })
        .collect()
}

fn encode_24(value: i32) -> [u8; 3] {
    let raw = (value as u32) & 0x00FF_FFFF;
    [(raw >> 16) as u8, (raw >> 8) as u8, raw as u8]
}

/// Packs the trace into 80-byte data notifications.
fn notifications(signal: &[i32]) -> Vec<Vec<u8>> {
    signal
        .chunks(RECORDS_PER_NOTIFICATION)
        .map(|chunk| {
            let mut payload = Vec::with_capacity(chunk.len() * 10);
            for &value in chunk {
                payload.push(0x00);
                payload.extend_from_slice(&encode_24(value));
                payload.extend_from_slice(&encode_24(value / 2));
                payload.extend_from_slice(&encode_24(-value));
            }
            payload
        })
        .collect()
}

async fn first_heart_rate(rx: &mut UnboundedReceiver<CoreEvent>) -> Option<(f64, Confidence)> {
    timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let CoreEvent::HeartRate(estimate) = event {
                return Some((estimate.bpm, estimate.confidence));
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn streamed_rhythm_reaches_a_confident_heart_rate() {
    let mut filter = DiscoveryFilter::new("DECG", 50);
    assert_eq!(
        filter.offer("dev-1", Some("DECG-001")),
        Admission::Accepted { limit_reached: false }
    );
    assert_eq!(filter.offer("dev-1", Some("DECG-001")), Admission::Duplicate);
    assert_eq!(filter.offer("dev-2", Some("Other")), Admission::NameMismatch);
    assert_eq!(filter.len(), 1);

    let (emitter, mut rx) = events::channel();
    let shutdown = CancellationToken::new();
    let acquisition_config = AcquisitionConfig {
        detection_interval_ms: 25,
        ..AcquisitionConfig::default()
    };
    let (acquisition, task) = Orchestrator::spawn(
        &acquisition_config,
        &SignalConfig::default(),
        emitter.clone(),
        shutdown.clone(),
    );

    let link = SessionLink::new(ConnectionStateMachine::new(emitter), acquisition.clone());
    link.apply(ConnectionEvent::ScanStarted);
    link.apply(ConnectionEvent::DeviceSelected("dev-1".into()));
    link.apply(ConnectionEvent::Connected);
    let (session, _effects) = link.resolve("dev-1 handles").expect("link should resolve");
    assert_eq!(link.state(), ConnectionState::Ready);

    let sender = RecordingSender::default();
    let executor = CommandExecutor::new(sender.clone());
    let start = StartTime::new(2025, 3, 14, 9, 26, 53);
    assert!(executor.start_collection(link.state(), Some(start)).await);
    {
        let frames = sender.frames.lock().unwrap();
        let frame = &frames[0];
        assert_eq!(frame.len(), 11);
        assert_eq!(&frame[..4], &[0xFA, 0x01, 0x01, 0x01]);
        assert_eq!(frame[10], 0xFB);
    }

    // Four seconds of signal, 75 bpm.
    let signal = beat_signal(800, 160);
    for payload in notifications(&signal) {
        assert_eq!(payload.len(), 80);
        assert_eq!(forward_payload(&payload, session, &acquisition), RECORDS_PER_NOTIFICATION);
    }
    acquisition.start();

    let (bpm, confidence) = first_heart_rate(&mut rx).await.expect("no heart rate published");
    assert_eq!(confidence, Confidence::High);
    assert!((bpm - 75.0).abs() < 0.5, "bpm = {bpm}");

    shutdown.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn nothing_is_published_after_the_link_drops() {
    let (emitter, mut rx) = events::channel();
    let shutdown = CancellationToken::new();
    let acquisition_config = AcquisitionConfig {
        detection_interval_ms: 10,
        ..AcquisitionConfig::default()
    };
    let (acquisition, _task) = Orchestrator::spawn(
        &acquisition_config,
        &SignalConfig::default(),
        emitter.clone(),
        shutdown.clone(),
    );

    let link = SessionLink::new(ConnectionStateMachine::new(emitter), acquisition.clone());
    link.apply(ConnectionEvent::DeviceSelected("dev-1".into()));
    link.apply(ConnectionEvent::Connected);
    let (session, _effects) = link.resolve("handles").expect("link should resolve");

    let payloads = notifications(&beat_signal(800, 160));
    for payload in &payloads {
        forward_payload(payload, session, &acquisition);
    }
    acquisition.start();
    assert!(first_heart_rate(&mut rx).await.is_some());

    link.apply(ConnectionEvent::Disconnected);
    assert_eq!(link.handles(), None);
    assert_eq!(forward_payload(&payloads[0], session, &acquisition), 0);

    let mut disconnected = false;
    let mut late = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), rx.recv()).await {
        match event {
            CoreEvent::ConnectionStateChanged(ConnectionState::Disconnected) => disconnected = true,
            other if disconnected => late.push(other),
            _ => {}
        }
    }
    assert!(disconnected);
    assert!(late.is_empty(), "published after disconnect: {late:?}");
    shutdown.cancel();
}
