//! Connection state and its transition table

use std::fmt;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::BridgeError;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Offline,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl ConnectionState {
    /// Link is down, channel values are stale
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ConnectionState::Offline | ConnectionState::Error | ConnectionState::Disconnected
        )
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Connecting, _) => true,
            // Re-entry after a transport-internal reconnect
            (Connected, Connected | Error | Disconnected | Offline) => true,
            (from, Connecting | Connected) => from.is_degraded(),
            (from, to) => from.is_degraded() && to.is_degraded(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub buffered: usize,
    pub dropped: usize,
    pub last_activity: Option<DateTime<Local>>,
    pub last_error: Option<String>,
}

/// Owner of the connection state; everything else only reads it
#[derive(Debug)]
pub struct ConnectionLifecycle {
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    degraded_notified: bool,
    status: MqttStatus,
}

impl Default for ConnectionLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionLifecycle {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Offline);
        Self {
            state: ConnectionState::Offline,
            state_tx,
            degraded_notified: false,
            status: MqttStatus::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn status(&self) -> &MqttStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut MqttStatus {
        &mut self.status
    }

    /// Moves to `next`; returns whether the state value changed
    pub fn transition(&mut self, next: ConnectionState) -> Result<bool, BridgeError> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition { from, to: next });
        }
        if next == ConnectionState::Connected {
            self.degraded_notified = false;
        }
        if from == next {
            debug!("Connection state stays {}", next);
            return Ok(false);
        }

        info!("Connection state: {} -> {}", from, next);
        self.state = next;
        self.status.connection_state = next;
        self.state_tx.send_replace(next);
        Ok(true)
    }

    /// True once per outage, on the first call while degraded
    pub fn take_degraded_notification(&mut self) -> bool {
        if self.state.is_degraded() && !self.degraded_notified {
            self.degraded_notified = true;
            true
        } else {
            false
        }
    }

    pub fn record_error(&mut self, reason: impl Into<String>) {
        self.status.last_error = Some(reason.into());
    }

    pub fn touch(&mut self) {
        self.status.last_activity = Some(Local::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn transition_table() {
        assert!(Offline.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connecting.can_transition_to(Error));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Connected.can_transition_to(Offline));
        assert!(Connected.can_transition_to(Connected));
        assert!(Error.can_transition_to(Connecting));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Offline.can_transition_to(Error));

        assert!(!Connected.can_transition_to(Connecting));
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut lifecycle = ConnectionLifecycle::new();
        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(Connected).unwrap();

        let err = lifecycle.transition(Connecting).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidTransition {
                from: Connected,
                to: Connecting
            }
        ));
        assert_eq!(lifecycle.state(), Connected);
    }

    #[test]
    fn degraded_notification_once_per_outage() {
        let mut lifecycle = ConnectionLifecycle::new();
        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(Connected).unwrap();
        assert!(!lifecycle.take_degraded_notification());

        lifecycle.transition(Offline).unwrap();
        assert!(lifecycle.take_degraded_notification());
        lifecycle.transition(Error).unwrap();
        assert!(!lifecycle.take_degraded_notification());

        lifecycle.transition(Connecting).unwrap();
        lifecycle.transition(Connected).unwrap();
        lifecycle.transition(Disconnected).unwrap();
        assert!(lifecycle.take_degraded_notification());
    }

    #[test]
    fn watchers_see_state_changes() {
        let mut lifecycle = ConnectionLifecycle::new();
        let rx = lifecycle.watch();
        lifecycle.transition(Connecting).unwrap();
        assert_eq!(*rx.borrow(), Connecting);
        assert_eq!(lifecycle.status().connection_state, Connecting);
        assert_eq!(Connecting.to_string(), "connecting");
    }
}
