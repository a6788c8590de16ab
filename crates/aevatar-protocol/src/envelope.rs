//! The routed transport unit.

use crate::ids::{AgentId, CorrelationId, EventId};
use crate::payload::TypedPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope schema version stamped on new envelopes.
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

/// Propagation target relative to the publishing agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Toward the parent.
    Up,
    /// Toward the children.
    Down,
    /// Split at the origin into one Up and one Down envelope.
    Both,
}

/// A routed message with direction, hop bookkeeping, and a typed payload.
///
/// `publishers` doubles as the visited set for cycle detection and never holds
/// the same id twice. `current_hop_count` grows by exactly one per forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub payload: TypedPayload,
    pub correlation_id: CorrelationId,
    pub publisher_id: AgentId,
    pub direction: Direction,
    #[serde(default)]
    pub should_stop_propagation: bool,
    /// Zero disables the per-envelope limit; the router's safety ceiling still applies.
    pub max_hop_count: u32,
    pub current_hop_count: u32,
    /// Zero means every hop may process the envelope.
    #[serde(default)]
    pub min_hop_count: u32,
    #[serde(default)]
    pub publishers: Vec<AgentId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn default_schema_version() -> u32 {
    ENVELOPE_SCHEMA_VERSION
}

impl EventEnvelope {
    /// Fresh envelope as seen by its publisher: hop zero, visited = [publisher].
    pub fn new(
        publisher_id: AgentId,
        payload: TypedPayload,
        direction: Direction,
        max_hop_count: u32,
    ) -> Self {
        Self {
            id: EventId::new_uuid(),
            timestamp: Utc::now(),
            version: ENVELOPE_SCHEMA_VERSION,
            payload,
            correlation_id: CorrelationId::new_uuid(),
            publishers: vec![publisher_id.clone()],
            publisher_id,
            direction,
            should_stop_propagation: false,
            max_hop_count,
            current_hop_count: 0,
            min_hop_count: 0,
            message: None,
        }
    }

    pub fn has_visited(&self, agent_id: &AgentId) -> bool {
        self.publishers.contains(agent_id)
    }

    /// Record `agent_id` as visited unless it already is.
    pub fn mark_visited(&mut self, agent_id: &AgentId) {
        if !self.has_visited(agent_id) {
            self.publishers.push(agent_id.clone());
        }
    }

    /// The copy sent one hop further by `forwarder`.
    pub fn forwarded_by(&self, forwarder: &AgentId, direction: Direction) -> Self {
        let mut next = self.clone();
        next.direction = direction;
        next.current_hop_count = self.current_hop_count.saturating_add(1);
        next.mark_visited(forwarder);
        next
    }

    pub fn with_min_hop_count(mut self, min_hop_count: u32) -> Self {
        self.min_hop_count = min_hop_count;
        self
    }

    pub fn with_max_hop_count(mut self, max_hop_count: u32) -> Self {
        self.max_hop_count = max_hop_count;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
