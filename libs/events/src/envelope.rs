//! Domain event envelope - the unit the relay carries from a committed row
//! mutation to the message bus.

use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::{Operation, ParseError, CURRENT_SCHEMA_VERSION, MAX_ROUTING_KEY_LEN};

const KNOWN_FIELDS: [&str; 5] = ["routing_key", "table", "op", "schema_version", "data"];

static NO_DATA: Value = Value::Null;

/// A validated change event.
///
/// Envelopes are immutable once constructed. Serializing a parsed envelope
/// reproduces the payload object exactly as it arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEventEnvelope {
    routing_key: String,
    op: Option<Operation>,
    schema_version: i32,
    body: Map<String, Value>,
}

impl DomainEventEnvelope {
    /// Creates an envelope at the current schema version.
    pub fn new(
        routing_key: impl Into<String>,
        table: impl Into<String>,
        op: Operation,
        data: Map<String, Value>,
    ) -> Result<Self, ParseError> {
        let routing_key = routing_key.into();
        if routing_key.trim().is_empty() {
            return Err(ParseError::MissingRoutingKey);
        }
        check_routing_key_len(&routing_key)?;

        let mut body = Map::new();
        body.insert("routing_key".to_string(), Value::String(routing_key.clone()));
        body.insert("table".to_string(), Value::String(table.into()));
        body.insert("op".to_string(), Value::String(op.as_str().to_string()));
        body.insert("schema_version".to_string(), Value::from(CURRENT_SCHEMA_VERSION));
        body.insert("data".to_string(), Value::Object(data));

        Ok(Self {
            routing_key,
            op: Some(op),
            schema_version: CURRENT_SCHEMA_VERSION,
            body,
        })
    }

    /// Parses and validates a raw notification payload.
    ///
    /// Syntax errors yield [`ParseError::Malformed`]. Valid JSON without a
    /// non-blank string `routing_key` (including non-object documents) yields
    /// [`ParseError::MissingRoutingKey`]. Known fields with unusable values
    /// yield [`ParseError::Invalid`]; `op`, `table` and `data` are only checked
    /// up to [`CURRENT_SCHEMA_VERSION`].
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw)?;

        let Value::Object(body) = value else {
            return Err(ParseError::MissingRoutingKey);
        };

        let routing_key = match body.get("routing_key") {
            Some(Value::String(key)) if !key.trim().is_empty() => key.clone(),
            _ => return Err(ParseError::MissingRoutingKey),
        };
        check_routing_key_len(&routing_key)?;

        let schema_version = match body.get("schema_version") {
            None => CURRENT_SCHEMA_VERSION,
            Some(version) => version
                .as_i64()
                .filter(|v| *v >= 1)
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| ParseError::Invalid {
                    field: "schema_version",
                    reason: format!("expected a positive integer, got {version}"),
                })?,
        };

        if schema_version > CURRENT_SCHEMA_VERSION {
            // Newer producers may use operations and shapes this version does not know.
            let op = match body.get("op") {
                Some(Value::String(op)) => op.parse().ok(),
                _ => None,
            };
            return Ok(Self {
                routing_key,
                op,
                schema_version,
                body,
            });
        }

        let op = match body.get("op") {
            Some(Value::String(op)) => op.parse()?,
            Some(other) => {
                return Err(ParseError::Invalid {
                    field: "op",
                    reason: format!("expected a string, got {}", json_kind(other)),
                })
            }
            None => {
                return Err(ParseError::Invalid {
                    field: "op",
                    reason: "missing".to_string(),
                })
            }
        };

        match body.get("table") {
            None | Some(Value::Null) | Some(Value::String(_)) => {}
            Some(other) => {
                return Err(ParseError::Invalid {
                    field: "table",
                    reason: format!("expected a string, got {}", json_kind(other)),
                })
            }
        }

        match body.get("data") {
            None | Some(Value::Null) | Some(Value::Object(_)) => {}
            Some(other) => {
                return Err(ParseError::Invalid {
                    field: "data",
                    reason: format!("expected an object, got {}", json_kind(other)),
                })
            }
        }

        Ok(Self {
            routing_key,
            op: Some(op),
            schema_version,
            body,
        })
    }

    /// Topic used for bus-side filtering, e.g. `instance.created`.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Source table name, empty when absent. Informational only.
    pub fn table(&self) -> &str {
        self.body
            .get("table")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// `None` only for newer schema versions carrying an operation this
    /// version does not know.
    pub fn op(&self) -> Option<Operation> {
        self.op
    }

    /// `op` as it appeared on the wire.
    pub fn raw_op(&self) -> Option<&str> {
        self.body.get("op").and_then(Value::as_str)
    }

    /// Declared version, or [`CURRENT_SCHEMA_VERSION`] when absent.
    pub fn schema_version(&self) -> i32 {
        self.schema_version
    }

    /// Row image, `null` when absent. For deletes this is the row as it was
    /// before deletion.
    pub fn data(&self) -> &Value {
        self.body.get("data").unwrap_or(&NO_DATA)
    }

    /// A top-level field not understood by this version of the validator.
    pub fn extension(&self, name: &str) -> Option<&Value> {
        if KNOWN_FIELDS.contains(&name) {
            return None;
        }
        self.body.get(name)
    }

    pub fn has_extensions(&self) -> bool {
        self.body
            .keys()
            .any(|key| !KNOWN_FIELDS.contains(&key.as_str()))
    }

    /// Serializes the full envelope to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl Serialize for DomainEventEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.body.serialize(serializer)
    }
}

impl FromStr for DomainEventEnvelope {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn check_routing_key_len(routing_key: &str) -> Result<(), ParseError> {
    if routing_key.len() > MAX_ROUTING_KEY_LEN {
        return Err(ParseError::Invalid {
            field: "routing_key",
            reason: format!(
                "{} bytes exceeds the {MAX_ROUTING_KEY_LEN} byte limit",
                routing_key.len()
            ),
        });
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
