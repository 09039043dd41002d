//! Error types for envelope validation.

use thiserror::Error;

/// Reasons a raw notification payload cannot become a deliverable envelope.
///
/// None of these are retryable: the same payload fails the same way every time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The payload is not valid JSON.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The payload has no usable `routing_key`.
    #[error("payload has no routing_key")]
    MissingRoutingKey,

    /// A known field is present but has an unusable value.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ParseError {
    /// Short label used in logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::Malformed(_) => "malformed",
            ParseError::MissingRoutingKey => "missing_routing_key",
            ParseError::Invalid { .. } => "invalid",
        }
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Malformed(err.to_string())
    }
}
