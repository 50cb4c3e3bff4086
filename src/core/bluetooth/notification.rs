//! Notification handling for DECG sensors
//! Subscribes to the info and data characteristics. Data payloads are decoded
//! on the spot and handed to the acquisition task; nothing heavier runs here.

use bluest::Characteristic;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::types::ConnectedDeviceState;
use crate::core::codec::decode_samples;
use crate::core::events::{CoreEvent, EventEmitter};
use crate::core::orchestrator::AcquisitionHandle;

/// Decodes one data notification and posts the samples for `session`.
/// Malformed groups are logged and skipped. Returns the number of samples accepted.
pub fn forward_payload(payload: &[u8], session: u64, acquisition: &AcquisitionHandle) -> usize {
    let batch = decode_samples(payload);
    for e in &batch.errors {
        warn!("Skipping malformed record: {}", e);
    }
    if batch.samples.is_empty() {
        return 0;
    }
    let count = batch.samples.len();
    if acquisition.post_samples(session, batch.samples) {
        count
    } else {
        0
    }
}

#[derive(Default)]
pub struct NotificationHandler {
    cancel_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that stops every stream started by the last `setup_notifications`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Subscribes to data and info notifications. A rejected subscription is
    /// logged and the other one keeps running.
    pub fn setup_notifications(
        &mut self,
        state: &ConnectedDeviceState,
        session: u64,
        acquisition: AcquisitionHandle,
        emitter: EventEmitter,
    ) {
        self.abort_tasks();
        self.cancel_token = CancellationToken::new();
        info!("Subscribing to notifications for session {}...", session);

        let data_char = state.data_characteristic.clone();
        let token = self.cancel_token.clone();
        self.tasks.push(tokio::spawn(async move {
            Self::listen(data_char, "data", token, |payload| {
                debug!("Data notification, {} bytes", payload.len());
                forward_payload(&payload, session, &acquisition);
            })
            .await;
        }));

        let info_char = state.info_characteristic.clone();
        let token = self.cancel_token.clone();
        self.tasks.push(tokio::spawn(async move {
            Self::listen(info_char, "info", token, |payload| {
                debug!("Info notification: {:02X?}", payload);
                emitter.emit(CoreEvent::InfoNotification(payload));
            })
            .await;
        }));
    }

    async fn listen<F>(characteristic: Characteristic, label: &str, cancel_token: CancellationToken, mut on_payload: F)
    where
        F: FnMut(Vec<u8>),
    {
        let mut stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to subscribe to {} notifications: {}", label, e);
                return;
            }
        };
        info!("Listening for {} notifications...", label);

        loop {
            tokio::select! {
                next = stream.next() => {
                    match next {
                        Some(Ok(value)) => on_payload(value),
                        Some(Err(e)) => {
                            error!("Error in {} notification stream: {}", label, e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
        info!("{} notification stream ended", label);
    }

    /// Stops both streams and waits for their tasks.
    pub async fn stop_notifications(&mut self) {
        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Notification task failed: {:?}", e);
                }
            }
        }
    }

    fn abort_tasks(&mut self) {
        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
