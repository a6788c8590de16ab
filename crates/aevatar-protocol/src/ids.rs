//! Typed ID wrappers for the agent kernel.
//!
//! IDs are opaque String wrappers (serde-transparent). Agents are usually
//! addressed by stable, human-chosen names; envelopes and events default to
//! UUID v4.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from any string value.
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Create a new ID using UUID v4 (random).
            pub fn new_uuid() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// View as string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new_uuid()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

typed_id!(
    /// Address of an agent. Stable for the agent's whole life.
    AgentId
);
typed_id!(
    /// Unique identifier for an envelope or a durable state event.
    EventId
);
typed_id!(
    /// Correlates every envelope descending from one publication.
    CorrelationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_is_unique() {
        let a = EventId::new_uuid();
        let b = EventId::new_uuid();
        assert_ne!(a, b);
    }

    #[test]
    fn agent_id_from_string() {
        let id = AgentId::from_string("planner");
        assert_eq!(id.as_str(), "planner");
        assert_eq!(id.to_string(), "planner");
    }

    #[test]
    fn typed_id_serializes_transparently() {
        let id = AgentId::from("worker-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"worker-1\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn typed_id_hash_equality() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(AgentId::from_string("same"));
        assert!(set.contains(&AgentId::from_string("same")));
    }
}
