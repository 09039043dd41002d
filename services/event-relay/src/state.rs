//! Lifecycle state for the bridge and its two external connections.
//!
//! The bridge owns one [`ConnectionMonitor`] per external system and is the only
//! component that moves it through `disconnected → connecting → connected →
//! disconnected`. The listener and publisher get a [`HealthReporter`], which can
//! only flip between `connected` and `degraded`.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

/// State of one external connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The session exists but the last operation failed; a retry or reconnect is pending.
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Externally visible lifecycle of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Uninitialized,
    Connecting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Uninitialized => "uninitialized",
            BridgeState::Connecting => "connecting",
            BridgeState::Running => "running",
            BridgeState::Stopping => "stopping",
            BridgeState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Owner-side handle for one external connection's state.
pub struct ConnectionMonitor {
    system: &'static str,
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionMonitor {
    pub fn new(system: &'static str) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            system,
            tx: Arc::new(tx),
        }
    }

    /// Name used in logs ("notification_source", "message_bus").
    pub fn system(&self) -> &'static str {
        self.system
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next` unconditionally. Only the bridge calls this.
    pub(crate) fn transition(&self, next: ConnectionState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            info!(
                system = self.system,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
        }
    }

    /// A handle that can only report degradation and recovery.
    pub(crate) fn reporter(&self) -> HealthReporter {
        HealthReporter {
            system: self.system,
            tx: Arc::clone(&self.tx),
        }
    }
}

/// Worker-side handle: flips `connected ⇄ degraded` and nothing else.
#[derive(Clone)]
pub struct HealthReporter {
    system: &'static str,
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl HealthReporter {
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Record a failed operation. No-op unless currently connected.
    pub fn degraded(&self, reason: &str) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Degraded;
                true
            } else {
                false
            }
        });
        if changed {
            warn!(system = self.system, reason, "Connection degraded");
        }
    }

    /// Record a successful operation after a failure. No-op unless degraded.
    pub fn recovered(&self) {
        let changed = self.tx.send_if_modified(|state| {
            if *state == ConnectionState::Degraded {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if changed {
            info!(system = self.system, "Connection recovered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_only_toggles_between_connected_and_degraded() {
        let monitor = ConnectionMonitor::new("message_bus");
        let reporter = monitor.reporter();

        reporter.degraded("publish failed");
        assert_eq!(monitor.current(), ConnectionState::Disconnected);

        monitor.transition(ConnectionState::Connected);
        reporter.degraded("publish failed");
        assert_eq!(monitor.current(), ConnectionState::Degraded);

        reporter.recovered();
        assert_eq!(monitor.current(), ConnectionState::Connected);

        monitor.transition(ConnectionState::Disconnected);
        reporter.recovered();
        assert_eq!(reporter.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = ConnectionMonitor::new("notification_source");
        let mut rx = monitor.subscribe();

        monitor.transition(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectionState::Connecting);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Degraded.to_string(), "degraded");
        assert_eq!(BridgeState::Uninitialized.to_string(), "uninitialized");
        assert_eq!(
            serde_json::to_string(&BridgeState::Running).unwrap(),
            "\"running\""
        );
    }
}
