//! Notification source abstraction.
//!
//! A source delivers raw payloads published on a named channel. It does not
//! queue notifications for absent subscribers: anything emitted while the
//! subscription is down is gone, and the stream says so with
//! [`SourceSignal::Reconnected`].

pub mod postgres;

use async_trait::async_trait;

use crate::error::ConnectionError;

pub use postgres::PgNotificationSource;

/// One item read from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSignal {
    /// A raw notification payload, in the order the source delivered it.
    Notification(String),

    /// The connection dropped and has been re-established. Notifications sent
    /// in between were missed.
    Reconnected,
}

/// Something that can open a subscription on a channel.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn NotificationStream>, ConnectionError>;
}

/// A live subscription.
#[async_trait]
pub trait NotificationStream: Send {
    /// Wait for the next signal. An error means the connection is down and
    /// could not be re-established; calling again retries it.
    async fn next_signal(&mut self) -> Result<SourceSignal, ConnectionError>;

    /// Unsubscribe and release the connection.
    async fn close(self: Box<Self>) -> Result<(), ConnectionError>;
}
