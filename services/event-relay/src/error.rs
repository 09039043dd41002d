//! Error types for the relay pipeline.

use thiserror::Error;

use crate::state::BridgeState;

/// Boxed transport error, so the pipeline does not depend on a particular driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cannot establish or keep a connection to one of the external systems.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The notification source (Postgres LISTEN connection).
    #[error("notification source unavailable: {0}")]
    Source(#[source] BoxError),

    /// The message bus.
    #[error("message bus unavailable: {0}")]
    Bus(#[source] BusError),
}

impl ConnectionError {
    pub fn source_error(err: impl Into<BoxError>) -> Self {
        ConnectionError::Source(err.into())
    }
}

/// A single failed operation against the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The channel was closed underneath us.
    #[error("bus channel is closed")]
    ChannelClosed,

    /// The broker refused the message (negative publisher confirm).
    #[error("broker rejected message for exchange '{exchange}'")]
    Rejected { exchange: String },

    /// Any other transport failure.
    #[error("bus transport error: {0}")]
    Transport(#[source] BoxError),
}

impl BusError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        BusError::Transport(err.into())
    }
}

/// Publishing an envelope failed.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Every attempt failed; the envelope is dropped.
    #[error("publish of '{routing_key}' to '{exchange}' failed after {attempts} attempts: {last_error}")]
    Exhausted {
        exchange: String,
        routing_key: String,
        attempts: u32,
        #[source]
        last_error: BusError,
    },

    /// The envelope could not be serialized.
    #[error("failed to serialize envelope: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handing an envelope to the publish workers failed.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The shard queue stayed full for the whole enqueue timeout.
    #[error("publish queue {shard} is full, dropping '{routing_key}'")]
    QueueFull { shard: usize, routing_key: String },

    /// The workers have shut down.
    #[error("publish workers have stopped")]
    Closed,
}

/// Lifecycle errors surfaced by [`crate::bridge::EventBridge`].
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot connect relay from state {0}")]
    InvalidState(BridgeState),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("relay start-up cancelled by disconnect")]
    Cancelled,
}

/// Database errors outside the notification stream.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },
}
