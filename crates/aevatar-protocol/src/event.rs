//! Durable records: state events, snapshots, and the built-in failure notification.

use crate::error::KernelResult;
use crate::ids::{AgentId, EventId};
use crate::payload::{AgentEvent, TypedPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// One record of an agent's append-only log.
///
/// `version` is 1-based and strictly contiguous per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub event_data: TypedPayload,
    pub agent_id: AgentId,
    pub version: u64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentStateEvent {
    pub fn new<E: AgentEvent>(
        agent_id: AgentId,
        version: u64,
        event: &E,
        metadata: HashMap<String, String>,
    ) -> KernelResult<Self> {
        let event_data = TypedPayload::encode(event)?;
        Ok(Self {
            event_id: EventId::new_uuid(),
            timestamp: Utc::now(),
            event_type: event_data.type_tag.clone(),
            event_data,
            agent_id,
            version,
            metadata,
        })
    }
}

/// Encoded state at a given log version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: AgentId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    pub state_data: Vec<u8>,
    /// SHA-256 hex digest of `state_data`.
    pub state_hash: String,
}

impl AgentSnapshot {
    pub fn new(agent_id: AgentId, version: u64, state_data: Vec<u8>) -> Self {
        let state_hash = sha256_hex(&state_data);
        Self {
            agent_id,
            version,
            timestamp: Utc::now(),
            state_data,
            state_hash,
        }
    }

    /// False when the stored digest does not match the stored bytes.
    pub fn is_intact(&self) -> bool {
        sha256_hex(&self.state_data) == self.state_hash
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Published Up by an agent whose handler failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailed {
    pub agent_id: AgentId,
    pub handler: String,
    pub event_id: EventId,
    pub event_type: String,
    /// Cause chain flattened into one line, outermost first.
    pub message: String,
}

impl AgentEvent for HandlerFailed {
    fn type_tag() -> &'static str {
        "aevatar.HandlerFailed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl AgentEvent for Deposited {
        fn type_tag() -> &'static str {
            "bank.Deposited"
        }
    }

    #[test]
    fn state_event_records_type_tag() {
        let event = AgentStateEvent::new(
            AgentId::from("acct"),
            4,
            &Deposited { amount: 10 },
            HashMap::new(),
        )
        .unwrap();
        assert_eq!(event.event_type, "bank.Deposited");
        assert_eq!(event.event_data.type_tag, "bank.Deposited");
        assert_eq!(event.version, 4);
    }

    #[test]
    fn snapshot_detects_tampering() {
        let mut snapshot = AgentSnapshot::new(AgentId::from("acct"), 100, b"{\"n\":1}".to_vec());
        assert!(snapshot.is_intact());
        snapshot.state_data = b"{\"n\":2}".to_vec();
        assert!(!snapshot.is_intact());
    }
}
