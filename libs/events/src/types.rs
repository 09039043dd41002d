//! Operation kinds, format constants, and the routing keys emitted by the
//! platform's notify triggers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Envelope format version produced by the current triggers.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Longest routing key the message bus accepts (AMQP short string).
pub const MAX_ROUTING_KEY_LEN: usize = 255;

// =============================================================================
// Routing Keys
// =============================================================================

/// Routing keys emitted by the installed triggers.
///
/// Keys follow `<entity>.<created|updated|deleted>`; consumers bind with topic
/// patterns such as `instance.*` or `#.deleted`.
pub mod routing_keys {
    // Agent catalog
    pub const AGENT_CREATED: &str = "agent.created";
    pub const AGENT_UPDATED: &str = "agent.updated";
    pub const AGENT_DELETED: &str = "agent.deleted";

    // Instance
    pub const INSTANCE_CREATED: &str = "instance.created";
    pub const INSTANCE_UPDATED: &str = "instance.updated";
    pub const INSTANCE_DELETED: &str = "instance.deleted";

    // Knowledge base entry
    pub const KNOWLEDGE_BASE_ENTRY_CREATED: &str = "knowledge_base_entry.created";
    pub const KNOWLEDGE_BASE_ENTRY_UPDATED: &str = "knowledge_base_entry.updated";
    pub const KNOWLEDGE_BASE_ENTRY_DELETED: &str = "knowledge_base_entry.deleted";
}

// =============================================================================
// Operation
// =============================================================================

/// The row mutation that produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    /// Wire spelling, matching Postgres `TG_OP`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    /// Past-tense verb used as the routing key suffix (`instance.created`).
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Insert => "created",
            Operation::Update => "updated",
            Operation::Delete => "deleted",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("INSERT") {
            Ok(Operation::Insert)
        } else if s.eq_ignore_ascii_case("UPDATE") {
            Ok(Operation::Update)
        } else if s.eq_ignore_ascii_case("DELETE") {
            Ok(Operation::Delete)
        } else {
            Err(ParseError::Invalid {
                field: "op",
                reason: format!("unknown operation '{s}'"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_serialization() {
        assert_eq!(
            serde_json::to_string(&Operation::Insert).unwrap(),
            "\"INSERT\""
        );
        assert_eq!(
            serde_json::to_string(&Operation::Delete).unwrap(),
            "\"DELETE\""
        );
    }

    #[test]
    fn test_operation_from_str_is_case_insensitive() {
        assert_eq!("update".parse::<Operation>().unwrap(), Operation::Update);
        assert_eq!("Delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!(matches!(
            "TRUNCATE".parse::<Operation>(),
            Err(ParseError::Invalid { field: "op", .. })
        ));
    }

    #[test]
    fn test_routing_keys_match_operation_verbs() {
        assert_eq!(
            routing_keys::INSTANCE_CREATED,
            format!("instance.{}", Operation::Insert.verb())
        );
        assert_eq!(
            routing_keys::KNOWLEDGE_BASE_ENTRY_DELETED,
            format!("knowledge_base_entry.{}", Operation::Delete.verb())
        );
    }
}
