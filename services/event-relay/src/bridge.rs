//! Bridge orchestrator.
//!
//! Owns the connect/disconnect lifecycle:
//!
//! ```text
//! uninitialized → connecting → running → stopping → stopped
//!                     │                                ▲
//!                     └──── start-up failure / cancel ─┘
//! ```
//!
//! `connect` opens the notification subscription and the bus channel, then
//! spawns the listener, the publish workers and a keep-alive task, and returns
//! without waiting for any notification. `disconnect` stops them in order and
//! releases both connections.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use crate::bus::{AmqpBus, MessageBus};
use crate::config::RelayConfig;
use crate::dispatch::{spawn_workers, WorkerPool};
use crate::error::{BridgeError, ConnectionError};
use crate::listener::{Listener, NotificationHandler};
use crate::publisher::Publisher;
use crate::source::{NotificationSource, PgNotificationSource};
use crate::state::{BridgeState, ConnectionMonitor, ConnectionState};
use crate::stats::{RelayStats, RelayStatsSnapshot};

/// Tasks and handles that exist only while running.
struct Running {
    listener: JoinHandle<Listener>,
    keepalive: JoinHandle<()>,
    workers: WorkerPool,
    publisher: Arc<Publisher>,
}

pub struct EventBridge {
    config: RelayConfig,
    source: Arc<dyn NotificationSource>,
    bus: Arc<dyn MessageBus>,
    state: watch::Sender<BridgeState>,
    source_state: ConnectionMonitor,
    bus_state: ConnectionMonitor,
    stats: Arc<RelayStats>,
    shutdown: watch::Sender<bool>,
    running: Mutex<Option<Running>>,
}

impl EventBridge {
    pub fn new(
        config: RelayConfig,
        source: Arc<dyn NotificationSource>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let (state, _) = watch::channel(BridgeState::Uninitialized);
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            source,
            bus,
            state,
            source_state: ConnectionMonitor::new("notification_source"),
            bus_state: ConnectionMonitor::new("message_bus"),
            stats: Arc::new(RelayStats::new()),
            shutdown,
            running: Mutex::new(None),
        }
    }

    /// Bridge over Postgres LISTEN/NOTIFY and RabbitMQ.
    pub fn from_config(config: RelayConfig) -> Self {
        let source = Arc::new(PgNotificationSource::new(config.database_url.clone()));
        let bus = Arc::new(AmqpBus::new(
            config.rabbitmq_url.clone(),
            config.exchange_durable,
        ));
        Self::new(config, source, bus)
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> BridgeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BridgeState> {
        self.state.subscribe()
    }

    pub fn source_state(&self) -> ConnectionState {
        self.source_state.current()
    }

    pub fn bus_state(&self) -> ConnectionState {
        self.bus_state.current()
    }

    pub fn subscribe_source_state(&self) -> watch::Receiver<ConnectionState> {
        self.source_state.subscribe()
    }

    pub fn subscribe_bus_state(&self) -> watch::Receiver<ConnectionState> {
        self.bus_state.subscribe()
    }

    pub fn stats(&self) -> RelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Running with both connections healthy.
    pub fn is_ready(&self) -> bool {
        self.state() == BridgeState::Running
            && self.source_state() == ConnectionState::Connected
            && self.bus_state() == ConnectionState::Connected
    }

    /// Establish both connections and start background processing.
    ///
    /// Valid only once, from `uninitialized`. Each connection is attempted up
    /// to `startup_attempts` times with backoff. On failure whatever was opened
    /// is released and the bridge ends in `stopped`.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let mut rejected = None;
        self.state.send_if_modified(|state| {
            if *state == BridgeState::Uninitialized {
                *state = BridgeState::Connecting;
                true
            } else {
                rejected = Some(*state);
                false
            }
        });
        if let Some(state) = rejected {
            return Err(BridgeError::InvalidState(state));
        }
        info!(
            channel = %self.config.listen_channel,
            exchange = %self.config.outgoing_exchange,
            "Connecting event relay"
        );

        // Resets the bridge if this future is dropped before it completes.
        let mut abandoned = AbandonedConnect {
            bridge: self,
            publisher: None,
            armed: true,
        };
        let mut shutdown = self.shutdown.subscribe();

        self.source_state.transition(ConnectionState::Connecting);
        let source = Arc::clone(&self.source);
        let channel = self.config.listen_channel.clone();
        let listener = match self
            .with_startup_retries("notification_source", &mut shutdown, || {
                let source = Arc::clone(&source);
                let channel = channel.clone();
                async move { Listener::start(source.as_ref(), &channel).await }
            })
            .await
        {
            Ok(listener) => listener,
            Err(err) => {
                abandoned.disarm();
                self.source_state.transition(ConnectionState::Disconnected);
                self.finish_stopped();
                return Err(err);
            }
        };
        self.source_state.transition(ConnectionState::Connected);

        let publisher = Arc::new(Publisher::new(
            Arc::clone(&self.bus),
            self.config.outgoing_exchange.clone(),
            self.config.retry.clone(),
            self.bus_state.reporter(),
            Arc::clone(&self.stats),
        ));
        abandoned.publisher = Some(Arc::clone(&publisher));

        self.bus_state.transition(ConnectionState::Connecting);
        let opened = self
            .with_startup_retries("message_bus", &mut shutdown, || {
                let publisher = Arc::clone(&publisher);
                async move {
                    publisher
                        .ensure_channel()
                        .await
                        .map(|_| ())
                        .map_err(ConnectionError::Bus)
                }
            })
            .await;
        if let Err(err) = opened {
            publisher.close().await;
            self.bus_state.transition(ConnectionState::Disconnected);
            let mut listener = listener;
            listener.stop().await;
            abandoned.disarm();
            self.source_state.transition(ConnectionState::Disconnected);
            self.finish_stopped();
            return Err(err);
        }
        self.bus_state.transition(ConnectionState::Connected);

        // Taken before spawning so nothing below awaits until the handles are stored.
        let mut slot = self.running.lock().await;

        let (dispatcher, workers) = spawn_workers(Arc::clone(&publisher), &self.config.dispatch);
        let handler = NotificationHandler::new(
            dispatcher,
            self.source_state.reporter(),
            Arc::clone(&self.stats),
        );
        let running = Running {
            listener: tokio::spawn(listener.run(
                handler,
                self.config.reconnect.clone(),
                self.shutdown.subscribe(),
            )),
            keepalive: tokio::spawn(keep_alive(
                self.config.keepalive_interval,
                self.shutdown.subscribe(),
            )),
            workers,
            publisher,
        };

        let promoted = self.state.send_if_modified(|state| {
            if *state == BridgeState::Connecting {
                *state = BridgeState::Running;
                true
            } else {
                false
            }
        });
        if !promoted {
            drop(slot);
            self.teardown(running).await;
            abandoned.disarm();
            self.finish_stopped();
            return Err(BridgeError::Cancelled);
        }
        *slot = Some(running);
        drop(slot);
        abandoned.disarm();

        info!("Event relay running");
        Ok(())
    }

    /// Stop background processing and release both connections.
    ///
    /// No-op before `connect` and after a previous `disconnect`. Cancels a
    /// `connect` still in progress. Errors while releasing are logged only.
    pub async fn disconnect(&self) {
        let mut previous = BridgeState::Uninitialized;
        self.state.send_if_modified(|state| {
            previous = *state;
            match *state {
                BridgeState::Connecting | BridgeState::Running => {
                    *state = BridgeState::Stopping;
                    true
                }
                _ => false,
            }
        });

        match previous {
            BridgeState::Uninitialized | BridgeState::Stopped => return,
            BridgeState::Connecting | BridgeState::Stopping => {
                self.shutdown.send_replace(true);
                let mut state = self.state.subscribe();
                let _ = state.wait_for(|state| *state == BridgeState::Stopped).await;
                return;
            }
            BridgeState::Running => {}
        }

        info!("Disconnecting event relay");
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            self.teardown(running).await;
        }
        self.finish_stopped();
        info!("Event relay stopped");
    }

    async fn teardown(&self, running: Running) {
        self.shutdown.send_replace(true);

        if let Err(err) = running.keepalive.await {
            warn!(error = %err, "Keep-alive task failed");
        }

        let listener = match running.listener.await {
            Ok(listener) => Some(listener),
            Err(err) => {
                error!(error = %err, "Listener task failed");
                None
            }
        };

        running.workers.shutdown(self.config.drain_timeout).await;

        running.publisher.close().await;
        self.bus_state.transition(ConnectionState::Disconnected);

        if let Some(mut listener) = listener {
            listener.stop().await;
        }
        self.source_state.transition(ConnectionState::Disconnected);
    }

    fn finish_stopped(&self) {
        let previous = self.state.send_replace(BridgeState::Stopped);
        if previous != BridgeState::Stopped {
            info!(from = %previous, "Event relay state changed to stopped");
        }
    }

    async fn with_startup_retries<T, F, Fut>(
        &self,
        system: &'static str,
        shutdown: &mut watch::Receiver<bool>,
        mut attempt_once: F,
    ) -> Result<T, BridgeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        let max_attempts = self.config.startup_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = stop_requested(shutdown) => return Err(BridgeError::Cancelled),
                result = attempt_once() => result,
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                error!(system, attempts = attempt, error = %err, "Giving up connecting");
                return Err(BridgeError::Connection(err));
            }

            let delay = self.config.reconnect.delay(attempt - 1);
            warn!(
                system,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Connection attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = stop_requested(shutdown) => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Puts the bridge in `stopped` when a `connect` future is dropped midway, so
/// a waiting `disconnect` returns.
struct AbandonedConnect<'a> {
    bridge: &'a EventBridge,
    publisher: Option<Arc<Publisher>>,
    armed: bool,
}

impl AbandonedConnect<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonedConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Connect abandoned before completing, stopping event relay");
        self.bridge.shutdown.send_replace(true);

        if let Some(publisher) = self.publisher.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { publisher.close().await });
                }
                Err(_) => warn!("No runtime to close the bus connection on"),
            }
        }

        self.bridge.bus_state.transition(ConnectionState::Disconnected);
        self.bridge
            .source_state
            .transition(ConnectionState::Disconnected);
        self.bridge.finish_stopped();
    }
}

async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Periodic no-op that marks the relay alive in traces until shutdown.
async fn keep_alive(interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(interval) => trace!("Event relay keep-alive"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingBus, ScriptedSource};

    fn bridge(source: &ScriptedSource, bus: &RecordingBus) -> EventBridge {
        EventBridge::new(
            RelayConfig::default(),
            Arc::new(source.clone()),
            Arc::new(bus.clone()),
        )
    }

    #[tokio::test]
    async fn test_connect_then_disconnect() {
        let source = ScriptedSource::new();
        let bus = RecordingBus::new();
        let bridge = bridge(&source, &bus);

        bridge.connect().await.unwrap();
        assert_eq!(bridge.state(), BridgeState::Running);
        assert!(bridge.is_ready());
        assert_eq!(source.subscribed_channel().as_deref(), Some("instances_notify"));
        assert_eq!(bus.exchange_declarations(), vec!["events.topic".to_string()]);

        bridge.disconnect().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert_eq!(bridge.source_state(), ConnectionState::Disconnected);
        assert_eq!(bridge.bus_state(), ConnectionState::Disconnected);
        assert!(source.is_closed());
        assert!(bus.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let source = ScriptedSource::new();
        let bus = RecordingBus::new();
        source.fail_subscribes(100);
        let bridge = Arc::new(EventBridge::new(
            RelayConfig {
                startup_attempts: 100,
                ..Default::default()
            },
            Arc::new(source.clone()),
            Arc::new(bus.clone()),
        ));

        let connecting = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.connect().await }
        });
        let mut states = bridge.subscribe_state();
        states
            .wait_for(|state| *state == BridgeState::Connecting)
            .await
            .unwrap();

        bridge.disconnect().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert!(matches!(
            connecting.await.unwrap(),
            Err(BridgeError::Cancelled)
        ));
        assert_eq!(bus.channels_opened(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_exits_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(keep_alive(Duration::from_secs(3600), rx));
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
