//! Relay counters.
//!
//! Dropped and failed events are only visible to operators through logs and
//! these counters; no caller is blocked on the relay.

use std::sync::atomic::{AtomicU64, Ordering};

use botberi_events::ParseError;
use serde::Serialize;

use crate::error::DispatchError;

/// Lock-free counters shared by the listener and publish workers.
#[derive(Debug, Default)]
pub struct RelayStats {
    notifications_received: AtomicU64,
    malformed: AtomicU64,
    missing_routing_key: AtomicU64,
    invalid: AtomicU64,
    published: AtomicU64,
    publish_retries: AtomicU64,
    publish_exhausted: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_closed: AtomicU64,
    source_reconnects: AtomicU64,
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct RelayStatsSnapshot {
    pub notifications_received: u64,
    pub malformed: u64,
    pub missing_routing_key: u64,
    pub invalid: u64,
    pub published: u64,
    pub publish_retries: u64,
    pub publish_exhausted: u64,
    pub dropped_overflow: u64,
    /// Arrived after the publish workers stopped.
    pub dropped_closed: u64,
    pub source_reconnects: u64,
}

impl RelayStatsSnapshot {
    /// Payloads rejected by the validator.
    pub fn rejected(&self) -> u64 {
        self.malformed + self.missing_routing_key + self.invalid
    }
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, err: &ParseError) {
        let counter = match err {
            ParseError::Malformed(_) => &self.malformed,
            ParseError::MissingRoutingKey => &self.missing_routing_key,
            ParseError::Invalid { .. } => &self.invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.publish_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted(&self) {
        self.publish_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, err: &DispatchError) {
        let counter = match err {
            DispatchError::QueueFull { .. } => &self.dropped_overflow,
            DispatchError::Closed => &self.dropped_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.source_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            missing_routing_key: self.missing_routing_key.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_retries: self.publish_retries.load(Ordering::Relaxed),
            publish_exhausted: self.publish_exhausted.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            source_reconnects: self.source_reconnects.load(Ordering::Relaxed),
        }
    }
}
