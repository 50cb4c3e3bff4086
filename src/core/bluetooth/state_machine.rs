//! Connection lifecycle as an explicit state machine
//! `transition` is a pure function over `(state, event)`; the effects it returns
//! are carried out by the manager. `ConnectionStateMachine` serializes
//! transitions and publishes every state change.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};
use serde::Serialize;

use crate::core::events::{CoreEvent, EventEmitter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    ServicesDiscovering,
    Ready,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Short status text for operators.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning...",
            Self::Connecting => "Connecting...",
            Self::ServicesDiscovering => "Discovering services...",
            Self::Ready => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Failed => "Connection failed",
        }
    }
}

/// Radio-stack callbacks and explicit requests that drive the lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ScanStarted,
    ScanStopped,
    ScanFailed(String),
    /// A candidate was picked for connection, by id.
    DeviceSelected(String),
    Connected,
    ConnectFailed(String),
    /// Both services and all three characteristics were found.
    ServicesResolved,
    DiscoveryFailed(String),
    Disconnected,
    /// Re-arms a terminal state back to `Idle`.
    Reset,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    StopScan,
    DiscoverServices,
    EnableNotifications,
    /// Drop every resolved characteristic handle.
    ClearHandles,
    /// Tell the acquisition side that the session is gone.
    NotifyDisconnect,
}

/// Computes the next state and its effects, or `None` when `event` does not
/// apply in `state`.
pub fn transition(
    state: ConnectionState,
    event: &ConnectionEvent,
) -> Option<(ConnectionState, Vec<Effect>)> {
    use ConnectionEvent as E;
    use ConnectionState as S;

    let next = match (state, event) {
        (S::Idle | S::Disconnected | S::Failed, E::ScanStarted) => (S::Scanning, vec![]),
        (S::Scanning, E::ScanStarted) => (S::Scanning, vec![]),
        (S::Scanning, E::ScanStopped) => (S::Idle, vec![]),
        (S::Scanning, E::ScanFailed(_)) => (S::Failed, vec![]),

        (S::Scanning, E::DeviceSelected(_)) => (S::Connecting, vec![Effect::StopScan]),
        (S::Idle | S::Disconnected | S::Failed, E::DeviceSelected(_)) => (S::Connecting, vec![]),

        (S::Connecting, E::Connected) => (S::ServicesDiscovering, vec![Effect::DiscoverServices]),
        (S::Connecting, E::ConnectFailed(_)) => (S::Failed, vec![Effect::ClearHandles]),

        (S::ServicesDiscovering, E::ServicesResolved) => {
            (S::Ready, vec![Effect::EnableNotifications])
        }
        (S::ServicesDiscovering, E::DiscoveryFailed(_)) => (
            S::Failed,
            vec![Effect::ClearHandles, Effect::NotifyDisconnect],
        ),

        (S::Disconnected, E::Disconnected) => (S::Disconnected, vec![]),
        (_, E::Disconnected) => (
            S::Disconnected,
            vec![Effect::ClearHandles, Effect::NotifyDisconnect],
        ),

        (S::Idle | S::Disconnected | S::Failed, E::Reset) => (S::Idle, vec![]),

        _ => return None,
    };
    Some(next)
}

/// Single-writer owner of the live `ConnectionState`.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: Arc<Mutex<ConnectionState>>,
    emitter: EventEmitter,
}

impl ConnectionStateMachine {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            emitter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.lock()
    }

    /// Applies `event` and returns the effects to run. Events that do not
    /// apply leave the state unchanged and yield no effects.
    pub fn apply(&self, event: ConnectionEvent) -> Vec<Effect> {
        self.apply_with(event, |effects| effects)
    }

    /// Re-arms a terminal state and enters `Scanning`. Returns false when a
    /// connection is in progress.
    pub fn begin_scan(&self) -> bool {
        if matches!(self.state(), ConnectionState::Disconnected | ConnectionState::Failed) {
            self.apply(ConnectionEvent::Reset);
        }
        self.apply(ConnectionEvent::ScanStarted);
        self.state() == ConnectionState::Scanning
    }

    /// Like `apply`, but hands the effects to `before_publish` before the new
    /// state is published. Whatever it returns is passed back to the caller.
    pub fn apply_with<F>(&self, event: ConnectionEvent, before_publish: F) -> Vec<Effect>
    where
        F: FnOnce(Vec<Effect>) -> Vec<Effect>,
    {
        let mut state = self.lock();
        match transition(*state, &event) {
            Some((next, effects)) => {
                let previous = *state;
                *state = next;
                let remaining = before_publish(effects);
                if next != previous {
                    info!("Connection state: {:?} -> {:?} on {:?}", previous, next, event);
                    self.emitter.emit(CoreEvent::ConnectionStateChanged(next));
                }
                remaining
            }
            None => {
                warn!("Ignoring {:?} in state {:?}", event, *state);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ConnectionEvent as E;
    use super::ConnectionState as S;
    use crate::core::events;

    const ALL_STATES: [ConnectionState; 7] = [
        S::Idle,
        S::Scanning,
        S::Connecting,
        S::ServicesDiscovering,
        S::Ready,
        S::Disconnected,
        S::Failed,
    ];

    #[test]
    fn happy_path_reaches_ready() {
        let steps = [
            (E::ScanStarted, S::Scanning, vec![]),
            (E::DeviceSelected("id".into()), S::Connecting, vec![Effect::StopScan]),
            (E::Connected, S::ServicesDiscovering, vec![Effect::DiscoverServices]),
            (E::ServicesResolved, S::Ready, vec![Effect::EnableNotifications]),
        ];
        let mut state = S::Idle;
        for (event, expected_state, expected_effects) in steps {
            let (next, effects) = transition(state, &event).unwrap();
            assert_eq!(next, expected_state);
            assert_eq!(effects, expected_effects);
            state = next;
        }
    }

    #[test]
    fn disconnect_applies_from_every_live_state() {
        for state in ALL_STATES {
            let (next, effects) = transition(state, &E::Disconnected).unwrap();
            assert_eq!(next, S::Disconnected);
            if state == S::Disconnected {
                assert!(effects.is_empty());
            } else {
                assert_eq!(effects, vec![Effect::ClearHandles, Effect::NotifyDisconnect]);
            }
        }
    }

    #[test]
    fn failures_are_terminal_until_rearmed() {
        let (state, _) = transition(S::Scanning, &E::ScanFailed("adapter".into())).unwrap();
        assert_eq!(state, S::Failed);
        assert!(transition(state, &E::Connected).is_none());
        assert!(transition(state, &E::ServicesResolved).is_none());

        assert_eq!(transition(state, &E::Reset).unwrap().0, S::Idle);
        assert_eq!(transition(state, &E::ScanStarted).unwrap().0, S::Scanning);
        assert_eq!(
            transition(S::Disconnected, &E::DeviceSelected("id".into())).unwrap().0,
            S::Connecting
        );
    }

    #[test]
    fn discovery_failure_tears_down() {
        let (state, effects) =
            transition(S::ServicesDiscovering, &E::DiscoveryFailed("missing service".into())).unwrap();
        assert_eq!(state, S::Failed);
        assert!(effects.contains(&Effect::NotifyDisconnect));
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        assert!(transition(S::Idle, &E::Connected).is_none());
        assert!(transition(S::Idle, &E::ServicesResolved).is_none());
        assert!(transition(S::Ready, &E::ScanStarted).is_none());
        assert!(transition(S::Ready, &E::DeviceSelected("id".into())).is_none());
        assert!(transition(S::Connecting, &E::ScanStopped).is_none());
        assert!(transition(S::Ready, &E::Reset).is_none());
    }

    #[tokio::test]
    async fn machine_publishes_only_real_changes() {
        let (emitter, mut rx) = events::channel();
        let machine = ConnectionStateMachine::new(emitter);

        machine.apply(E::ScanStarted);
        machine.apply(E::ScanStarted);
        assert!(machine.apply(E::Connected).is_empty());
        machine.apply(E::ScanStopped);

        assert_eq!(machine.state(), S::Idle);
        assert_eq!(rx.recv().await, Some(CoreEvent::ConnectionStateChanged(S::Scanning)));
        assert_eq!(rx.recv().await, Some(CoreEvent::ConnectionStateChanged(S::Idle)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn scanning_rearms_a_failed_link() {
        let (emitter, mut rx) = events::channel();
        let machine = ConnectionStateMachine::new(emitter);
        machine.apply(E::DeviceSelected("id".into()));
        machine.apply(E::ConnectFailed("timeout".into()));
        assert_eq!(machine.state(), S::Failed);

        assert!(machine.begin_scan());
        let mut states = Vec::new();
        while let Ok(CoreEvent::ConnectionStateChanged(state)) = rx.try_recv() {
            states.push(state);
        }
        assert_eq!(states, vec![S::Connecting, S::Failed, S::Idle, S::Scanning]);
    }

    #[test]
    fn scanning_is_refused_while_connecting() {
        let (emitter, _rx) = events::channel();
        let machine = ConnectionStateMachine::new(emitter);
        machine.apply(E::DeviceSelected("id".into()));
        assert!(!machine.begin_scan());
        assert_eq!(machine.state(), S::Connecting);
    }

    #[test]
    fn clones_share_one_state() {
        let (emitter, _rx) = events::channel();
        let machine = ConnectionStateMachine::new(emitter);
        let other = machine.clone();
        other.apply(E::ScanStarted);
        assert_eq!(machine.state(), S::Scanning);
    }
}
