//! # botberi-events
//!
//! Change-event envelope definitions and validation for the botberi platform.
//!
//! ## Design Principles
//!
//! - An envelope is an immutable record of one committed row mutation
//! - Envelopes carry their own routing key; the relay never derives one
//! - Envelopes are versioned (`schema_version`) so consumers can branch on format
//! - Fields the validator does not understand are carried through untouched
//!
//! ## Wire Format
//!
//! The database trigger emits one JSON object per committed mutation:
//!
//! ```json
//! {
//!   "routing_key": "instance.created",
//!   "table": "instances",
//!   "op": "INSERT",
//!   "schema_version": 1,
//!   "data": { "id": 42 }
//! }
//! ```
//!
//! [`DomainEventEnvelope::parse`] turns that text into an envelope or a
//! [`ParseError`] describing why it cannot be delivered.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::ParseError;
pub use types::*;
