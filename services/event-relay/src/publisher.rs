//! Publishes validated envelopes onto the topic exchange.
//!
//! The channel is opened lazily and shared by every publish worker. Opening it
//! and declaring the exchange happen under one lock, so concurrent first
//! callers get the same channel and the exchange is declared once per channel.

use std::sync::Arc;

use botberi_events::DomainEventEnvelope;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bus::{BusChannel, MessageBus, OutboundMessage};
use crate::error::{BusError, PublishError};
use crate::retry::RetryPolicy;
use crate::state::HealthReporter;
use crate::stats::RelayStats;

pub struct Publisher {
    bus: Arc<dyn MessageBus>,
    exchange: String,
    retry: RetryPolicy,
    channel: Mutex<Option<Arc<dyn BusChannel>>>,
    health: HealthReporter,
    stats: Arc<RelayStats>,
}

impl Publisher {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        exchange: impl Into<String>,
        retry: RetryPolicy,
        health: HealthReporter,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            bus,
            exchange: exchange.into(),
            retry,
            channel: Mutex::new(None),
            health,
            stats,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Return the shared channel, opening it and declaring the exchange first
    /// if there is none or the cached one has closed.
    pub async fn ensure_channel(&self) -> Result<Arc<dyn BusChannel>, BusError> {
        let mut guard = self.channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            debug!("Cached bus channel is closed, reopening");
        }
        *guard = None;

        let channel = self.bus.open_channel().await?;
        channel.declare_topic_exchange(&self.exchange).await?;
        info!(exchange = %self.exchange, "Declared topic exchange");

        *guard = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// Publish the full envelope under its routing key.
    ///
    /// Transient failures are retried per the [`RetryPolicy`]. When every
    /// attempt fails the envelope is lost and [`PublishError::Exhausted`] is
    /// returned.
    #[instrument(skip(self, envelope), fields(routing_key = envelope.routing_key()))]
    pub async fn publish(&self, envelope: &DomainEventEnvelope) -> Result<(), PublishError> {
        let message = OutboundMessage::json(envelope.to_json_bytes()?);
        let routing_key = envelope.routing_key();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_publish(routing_key, &message).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(attempt, "Published after retry");
                    }
                    self.health.recovered();
                    self.stats.record_published();
                    return Ok(());
                }
                Err(err) => {
                    self.health.degraded(&err.to_string());

                    if !self.retry.should_retry(attempt) {
                        self.stats.record_exhausted();
                        return Err(PublishError::Exhausted {
                            exchange: self.exchange.clone(),
                            routing_key: routing_key.to_string(),
                            attempts: attempt,
                            last_error: err,
                        });
                    }

                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn try_publish(&self, routing_key: &str, message: &OutboundMessage) -> Result<(), BusError> {
        let channel = self.ensure_channel().await?;
        let result = channel.publish(&self.exchange, routing_key, message).await;
        if result.is_err() && !channel.is_open() {
            self.discard_channel(&channel).await;
        }
        result
    }

    async fn discard_channel(&self, channel: &Arc<dyn BusChannel>) {
        let mut guard = self.channel.lock().await;
        if guard
            .as_ref()
            .is_some_and(|cached| Arc::ptr_eq(cached, channel))
        {
            *guard = None;
        }
    }

    /// Close the channel, then the bus connection. Errors are logged, not returned.
    pub async fn close(&self) {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "Failed to close bus channel");
            }
        }
        if let Err(err) = self.bus.close().await {
            warn!(error = %err, "Failed to close bus connection");
        }
    }
}
