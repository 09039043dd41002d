//! Message bus abstraction.
//!
//! The publisher only needs three things from a bus: a logical channel, an
//! idempotent topic-exchange declaration, and a publish call. [`amqp`] provides
//! the RabbitMQ implementation; [`crate::testing::RecordingBus`] an in-memory one.

pub mod amqp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BusError;

pub use amqp::AmqpBus;

/// Media type of every message the relay publishes.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

impl OutboundMessage {
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: JSON_CONTENT_TYPE,
        }
    }
}

/// Connection to a message bus.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Open a new logical channel, (re)connecting first if needed.
    async fn open_channel(&self) -> Result<Arc<dyn BusChannel>, BusError>;

    /// Close the underlying connection. Safe to call more than once.
    async fn close(&self) -> Result<(), BusError>;
}

/// A logical channel on a bus connection.
#[async_trait]
pub trait BusChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Declare `name` as a topic exchange. Repeating an identical declaration is a no-op.
    async fn declare_topic_exchange(&self, name: &str) -> Result<(), BusError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;
}
