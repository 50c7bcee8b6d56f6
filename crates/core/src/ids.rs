//! Typed identifiers.
//!
//! Agents are addressed by caller-chosen string ids. Everything the mesh
//! generates itself (events, correlations, failures, records, anomalies) gets
//! a ULID so ids sort by creation time.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier of a registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    /// Create an agent id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AgentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for AgentId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Ulid);

        impl $name {
            /// Create a new random id.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Create from a ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Get the inner ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(
    /// Unique identifier for a published event.
    EventId
);
ulid_id!(
    /// Correlates an outbound agent message with its reply.
    CorrelationId
);
ulid_id!(
    /// Identifies a failure record owned by the recovery manager.
    FailureId
);
ulid_id!(
    /// Identifies a communication record in the bounded history.
    RecordId
);
ulid_id!(
    /// Identifies a detected anomaly.
    AnomalyId
);

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_agent_id_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(AgentId::from("sales-1"), 7);
        assert_eq!(map.get("sales-1"), Some(&7));
    }

    #[test]
    fn test_agent_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&AgentId::new("support")).ok();
        assert_eq!(json.as_deref(), Some("\"support\""));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
        assert_ne!(FailureId::new(), FailureId::new());
    }
}
