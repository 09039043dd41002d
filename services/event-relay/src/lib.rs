//! Botberi event relay library.
//!
//! This crate primarily ships an `event-relay` binary that forwards Postgres
//! row-change notifications to a RabbitMQ topic exchange. The library surface
//! exists for integration testing and for embedding the bridge in another
//! process.

pub mod api;
pub mod bridge;
pub mod bus;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod publisher;
pub mod retry;
pub mod source;
pub mod state;
pub mod stats;
pub mod testing;

pub use bridge::EventBridge;
pub use config::{Config, RelayConfig};
pub use error::BridgeError;
