//! Notification listener.
//!
//! Reads raw payloads from the notification source, validates them, and hands
//! valid envelopes to the publish workers. Bad payloads are logged and dropped;
//! nothing a single payload contains can stop the loop.

use std::sync::Arc;

use botberi_events::{DomainEventEnvelope, ParseError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{ConnectionError, DispatchError};
use crate::retry::BackoffPolicy;
use crate::source::{NotificationSource, NotificationStream, SourceSignal};
use crate::state::HealthReporter;
use crate::stats::RelayStats;

/// What happened to one payload.
#[derive(Debug)]
pub enum HandleOutcome {
    /// Queued for publishing.
    Dispatched,
    /// Failed validation and was dropped.
    Rejected(ParseError),
    /// Valid, but the publish queue would not take it.
    Dropped(DispatchError),
}

/// Validates payloads and routes them to the publish workers.
pub struct NotificationHandler {
    dispatcher: Dispatcher,
    health: HealthReporter,
    stats: Arc<RelayStats>,
}

impl NotificationHandler {
    pub fn new(dispatcher: Dispatcher, health: HealthReporter, stats: Arc<RelayStats>) -> Self {
        Self {
            dispatcher,
            health,
            stats,
        }
    }

    /// Handle one raw payload. Never fails: every outcome is logged and counted.
    pub async fn on_notification(&self, raw: &str) -> HandleOutcome {
        self.stats.record_notification();

        let envelope = match DomainEventEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, payload = raw, "Dropping invalid notification");
                self.stats.record_rejected(&err);
                return HandleOutcome::Rejected(err);
            }
        };

        debug!(
            routing_key = envelope.routing_key(),
            table = envelope.table(),
            op = envelope.raw_op().unwrap_or_default(),
            "Accepted notification"
        );

        match self.dispatcher.dispatch(envelope).await {
            Ok(()) => HandleOutcome::Dispatched,
            Err(err) => {
                warn!(error = %err, payload = raw, "Dropping notification, publish queue unavailable");
                self.stats.record_dropped(&err);
                HandleOutcome::Dropped(err)
            }
        }
    }
}

/// A subscription on one channel plus the loop that drains it.
pub struct Listener {
    channel: String,
    stream: Option<Box<dyn NotificationStream>>,
}

impl Listener {
    /// Subscribe to `channel`. Returns once the subscription is active.
    pub async fn start(source: &dyn NotificationSource, channel: &str) -> Result<Self, ConnectionError> {
        let stream = source.subscribe(channel).await?;
        Ok(Self {
            channel: channel.to_string(),
            stream: Some(stream),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn is_listening(&self) -> bool {
        self.stream.is_some()
    }

    /// Process signals until `shutdown` flips to true or its sender is dropped.
    ///
    /// Payloads are handled strictly in the order the source delivers them.
    /// When the source connection fails, the loop reports the connection as
    /// degraded and keeps retrying with `reconnect` backoff. Returns the
    /// listener so the caller can [`Listener::stop`] it after the publish
    /// workers have drained.
    pub async fn run(
        mut self,
        handler: NotificationHandler,
        reconnect: BackoffPolicy,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let Some(stream) = self.stream.as_mut() else {
            return self;
        };
        info!(channel = %self.channel, "Notification listener started");

        let mut failures: u32 = 0;
        loop {
            let signal = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                signal = stream.next_signal() => signal,
            };

            match signal {
                Ok(SourceSignal::Notification(payload)) => {
                    failures = 0;
                    handler.health.recovered();
                    handler.on_notification(&payload).await;
                }
                Ok(SourceSignal::Reconnected) => {
                    failures = 0;
                    handler.stats.record_reconnect();
                    warn!(
                        channel = %self.channel,
                        "Notification source reconnected, notifications sent while disconnected were missed"
                    );
                    handler.health.recovered();
                }
                Err(err) => {
                    handler.health.degraded(&err.to_string());
                    let delay = reconnect.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        channel = %self.channel,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Notification source unavailable, reconnecting"
                    );

                    tokio::select! {
                        biased;
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(channel = %self.channel, "Notification listener stopped");
        self
    }

    /// Unsubscribe and close the source connection. Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if let Err(err) = stream.close().await {
            warn!(channel = %self.channel, error = %err, "Failed to close notification source");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatch::{spawn_workers, DispatchConfig, WorkerPool};
    use crate::publisher::Publisher;
    use crate::retry::RetryPolicy;
    use crate::state::{ConnectionMonitor, ConnectionState};
    use crate::testing::{RecordingBus, ScriptedSource};

    const VALID: &str = r#"{"routing_key":"instance.created","table":"instances","op":"INSERT","schema_version":1,"data":{"id":"i-1"}}"#;

    struct Harness {
        bus: RecordingBus,
        source_monitor: ConnectionMonitor,
        stats: Arc<RelayStats>,
        handler: NotificationHandler,
        pool: WorkerPool,
    }

    fn harness() -> Harness {
        let bus = RecordingBus::new();
        let bus_monitor = ConnectionMonitor::new("message_bus");
        let source_monitor = ConnectionMonitor::new("notification_source");
        let stats = Arc::new(RelayStats::new());
        let publisher = Arc::new(Publisher::new(
            Arc::new(bus.clone()),
            "events.topic",
            RetryPolicy::default(),
            bus_monitor.reporter(),
            Arc::clone(&stats),
        ));
        let (dispatcher, pool) = spawn_workers(publisher, &DispatchConfig::default());
        let handler = NotificationHandler::new(dispatcher, source_monitor.reporter(), Arc::clone(&stats));
        Harness {
            bus,
            source_monitor,
            stats,
            handler,
            pool,
        }
    }

    #[tokio::test]
    async fn test_handler_rejects_and_counts_bad_payloads() {
        let h = harness();

        assert!(matches!(
            h.handler.on_notification("not-json").await,
            HandleOutcome::Rejected(ParseError::Malformed(_))
        ));
        assert!(matches!(
            h.handler.on_notification(r#"{"table":"instances"}"#).await,
            HandleOutcome::Rejected(ParseError::MissingRoutingKey)
        ));
        assert!(matches!(
            h.handler.on_notification(VALID).await,
            HandleOutcome::Dispatched
        ));

        let published = h.bus.wait_for_published(1, Duration::from_secs(5)).await;
        assert_eq!(published.len(), 1);

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.notifications_received, 3);
        assert_eq!(snapshot.malformed, 1);
        assert_eq!(snapshot.missing_routing_key, 1);

        drop(h.handler);
        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_stop_closes_source() {
        let h = harness();
        let source = ScriptedSource::new();
        let listener = Listener::start(&source, "instances_notify").await.unwrap();
        assert_eq!(source.subscribed_channel().as_deref(), Some("instances_notify"));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(h.handler, BackoffPolicy::default(), shutdown_rx));

        source.notify(VALID);
        let published = h.bus.wait_for_published(1, Duration::from_secs(5)).await;
        assert_eq!(published[0].routing_key, "instance.created");

        shutdown_tx.send_replace(true);
        let mut listener = task.await.unwrap();
        assert!(listener.is_listening());

        listener.stop().await;
        listener.stop().await;
        assert!(!listener.is_listening());
        assert!(source.is_closed());

        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_failure_degrades_then_recovers() {
        let h = harness();
        h.source_monitor.transition(ConnectionState::Connected);
        let mut states = h.source_monitor.subscribe();

        let source = ScriptedSource::new();
        let listener = Listener::start(&source, "instances_notify").await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(h.handler, BackoffPolicy::default(), shutdown_rx));

        source.fail_next_receive("connection reset");
        states
            .wait_for(|state| *state == ConnectionState::Degraded)
            .await
            .unwrap();
        states
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(h.stats.snapshot().source_reconnects, 1);

        source.notify(VALID);
        let published = h.bus.wait_for_published(1, Duration::from_secs(5)).await;
        assert_eq!(published.len(), 1);

        shutdown_tx.send_replace(true);
        let mut listener = task.await.unwrap();
        listener.stop().await;
        h.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_counts_stopped_workers_apart_from_overflow() {
        let h = harness();
        // Dispatcher still alive, so the workers are aborted rather than drained.
        h.pool.shutdown(Duration::from_millis(10)).await;

        let mut attempts = 0;
        loop {
            attempts += 1;
            assert!(attempts < 100, "workers never stopped accepting envelopes");
            match h.handler.on_notification(VALID).await {
                HandleOutcome::Dropped(DispatchError::Closed) => break,
                HandleOutcome::Dispatched => tokio::time::sleep(Duration::from_millis(1)).await,
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.dropped_closed, 1);
        assert_eq!(snapshot.dropped_overflow, 0);
    }
}
