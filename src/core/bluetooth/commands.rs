//! Outbound control commands
//! Commands go out only while the link is `Ready` and the control
//! characteristic is resolved. Anything else is dropped with a log entry;
//! nothing is queued or retried.

use anyhow::Result;
use log::{debug, error, info, warn};

use crate::core::bluetooth::state_machine::ConnectionState;
use crate::core::codec::{CollectionStart, ControlCommand, StartTime};

/// Writes encoded control frames to the sensor
#[async_trait::async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, command: ControlCommand) -> Result<()>;
}

/// Gatekeeper between callers and the control characteristic
pub struct CommandExecutor<T: CommandSender> {
    command_sender: Option<T>,
}

impl<T: CommandSender> CommandExecutor<T> {
    pub fn new(command_sender: T) -> Self {
        Self {
            command_sender: Some(command_sender),
        }
    }

    /// An executor whose control characteristic has not been resolved yet
    pub fn unresolved() -> Self {
        Self {
            command_sender: None,
        }
    }

    /// Sends `command` if `state` allows it. Returns whether the frame was written.
    pub async fn send(&self, state: ConnectionState, command: ControlCommand) -> bool {
        if state != ConnectionState::Ready {
            warn!("Dropping {:?}: link is {:?}, not Ready", command, state);
            return false;
        }
        let Some(sender) = self.command_sender.as_ref() else {
            error!("Dropping {:?}: control characteristic not resolved", command);
            return false;
        };

        debug!("Control frame {:02X?}", command.to_bytes());
        match sender.send_command(command).await {
            Ok(()) => {
                info!("Sent {:?}", command);
                true
            }
            Err(e) => {
                error!("Failed to write {:?}: {}", command, e);
                false
            }
        }
    }

    /// Starts on-device collection stamped with `start_time`, if any.
    pub async fn start_collection(&self, state: ConnectionState, start_time: Option<StartTime>) -> bool {
        let start = match start_time {
            Some(time) => CollectionStart::At(time),
            None => CollectionStart::Untimed,
        };
        self.send(state, ControlCommand::StartCollection(start)).await
    }

    pub async fn stop_collection(&self, state: ConnectionState) -> bool {
        self.send(state, ControlCommand::StopCollection).await
    }

    pub async fn start_transfer(&self, state: ConnectionState) -> bool {
        self.send(state, ControlCommand::StartTransfer).await
    }

    pub async fn stop_transfer(&self, state: ConnectionState) -> bool {
        self.send(state, ControlCommand::StopTransfer).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    /// Records every frame it is asked to write.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSender {
        pub(crate) frames: Arc<Mutex<Vec<Vec<u8>>>>,
        pub(crate) fail: bool,
    }

    #[async_trait::async_trait]
    impl CommandSender for RecordingSender {
        async fn send_command(&self, command: ControlCommand) -> Result<()> {
            if self.fail {
                return Err(anyhow!("write rejected"));
            }
            self.frames.lock().unwrap().push(command.to_bytes());
            Ok(())
        }
    }

    #[tokio::test]
    async fn ready_link_writes_frames() {
        let sender = RecordingSender::default();
        let executor = CommandExecutor::new(sender.clone());

        let time = StartTime::new(2025, 3, 14, 9, 26, 53);
        assert!(executor.start_collection(ConnectionState::Ready, Some(time)).await);
        assert!(executor.start_transfer(ConnectionState::Ready).await);

        let frames = sender.frames.lock().unwrap();
        assert_eq!(
            frames[0],
            vec![0xFA, 0x01, 0x01, 0x01, 25, 3, 14, 9, 26, 53, 0xFB]
        );
        assert_eq!(frames[1], vec![0xFA, 0x02, 0x01, 0xFB]);
    }

    #[tokio::test]
    async fn commands_outside_ready_are_dropped() {
        let sender = RecordingSender::default();
        let executor = CommandExecutor::new(sender.clone());

        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::ServicesDiscovering,
            ConnectionState::Disconnected,
        ] {
            assert!(!executor.stop_collection(state).await);
        }
        assert!(sender.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolved_control_characteristic_drops_silently() {
        let executor: CommandExecutor<RecordingSender> = CommandExecutor::unresolved();
        assert!(!executor.stop_transfer(ConnectionState::Ready).await);
    }

    #[tokio::test]
    async fn write_failure_is_reported_not_raised() {
        let sender = RecordingSender {
            fail: true,
            ..RecordingSender::default()
        };
        let executor = CommandExecutor::new(sender);
        assert!(!executor.start_collection(ConnectionState::Ready, None).await);
    }
}
