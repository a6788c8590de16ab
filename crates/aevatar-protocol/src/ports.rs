//! Boundary ports between the kernel and its hosts.
//!
//! These traits are the only way the kernel reaches transports, durable
//! storage, and observability sinks.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Observer callbacks are synchronous and must not block.

use crate::envelope::EventEnvelope;
use crate::error::KernelResult;
use crate::event::{AgentSnapshot, AgentStateEvent};
use crate::ids::AgentId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Moves envelopes between agents.
///
/// Awaiting a delivery means the target accepted the envelope, not that it
/// finished handling it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver_to_agent(&self, target: &AgentId, envelope: EventEnvelope)
    -> KernelResult<()>;
}

/// Which record of an agent a [`StateStore`] entry holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKind {
    State,
    /// Config is isolated by agent type when agent kinds share a store.
    Config {
        agent_type: String,
    },
    Hierarchy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    pub agent_id: AgentId,
    pub kind: RecordKind,
}

impl StateKey {
    pub fn state(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            kind: RecordKind::State,
        }
    }

    pub fn config(agent_id: AgentId, agent_type: impl Into<String>) -> Self {
        Self {
            agent_id,
            kind: RecordKind::Config {
                agent_type: agent_type.into(),
            },
        }
    }

    pub fn hierarchy(agent_id: AgentId) -> Self {
        Self {
            agent_id,
            kind: RecordKind::Hierarchy,
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RecordKind::State => write!(f, "{}/state", self.agent_id),
            RecordKind::Config { agent_type } => write!(f, "{}/config/{agent_type}", self.agent_id),
            RecordKind::Hierarchy => write!(f, "{}/hierarchy", self.agent_id),
        }
    }
}

/// Keyed store for state, config and hierarchy documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, key: &StateKey) -> KernelResult<Option<Vec<u8>>>;
    async fn save(&self, key: &StateKey, data: Vec<u8>) -> KernelResult<()>;
}

/// Append-only, per-agent event log with a sparse snapshot table.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Appends the whole batch or nothing.
    ///
    /// Fails with `KernelError::VersionConflict` unless the log head equals
    /// `expected_base_version` and the batch continues it contiguously.
    /// Returns the new head version.
    async fn append_events(
        &self,
        agent_id: &AgentId,
        batch: Vec<AgentStateEvent>,
        expected_base_version: u64,
    ) -> KernelResult<u64>;

    /// Events with `version >= from_version`, ascending.
    async fn get_events(
        &self,
        agent_id: &AgentId,
        from_version: u64,
    ) -> KernelResult<Vec<AgentStateEvent>>;

    async fn latest_version(&self, agent_id: &AgentId) -> KernelResult<u64>;

    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> KernelResult<Option<AgentSnapshot>>;

    async fn save_snapshot(&self, agent_id: &AgentId, snapshot: AgentSnapshot) -> KernelResult<()>;
}

/// Why the router declined to forward an envelope to a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Target already in the envelope's publishers.
    Cycle,
    /// `max_hop_count` or the safety ceiling reached.
    HopLimit,
    /// Target is the forwarding agent itself.
    SelfTarget,
    /// The caller's cancellation token fired before the hop was issued.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cycle => "cycle",
            Self::HopLimit => "hop_limit",
            Self::SelfTarget => "self_target",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Observability sink. Every callback defaults to a no-op.
pub trait KernelObserver: Send + Sync {
    fn event_published(&self, _agent_id: &AgentId, _envelope: &EventEnvelope) {}

    fn event_handled(
        &self,
        _agent_id: &AgentId,
        _envelope: &EventEnvelope,
        _handlers: usize,
        _elapsed: Duration,
    ) {
    }

    fn event_dropped(&self, _agent_id: &AgentId, _envelope: &EventEnvelope) {}

    fn handler_failed(&self, _agent_id: &AgentId, _handler: &str, _message: &str) {}

    fn routing_skipped(&self, _agent_id: &AgentId, _target: &AgentId, _reason: SkipReason) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_keys_render_by_kind() {
        let id = AgentId::from("a1");
        assert_eq!(StateKey::state(id.clone()).to_string(), "a1/state");
        assert_eq!(
            StateKey::config(id.clone(), "Counter").to_string(),
            "a1/config/Counter"
        );
        assert_eq!(StateKey::hierarchy(id).to_string(), "a1/hierarchy");
    }

    #[test]
    fn config_keys_differ_by_agent_type() {
        let id = AgentId::from("shared");
        assert_ne!(
            StateKey::config(id.clone(), "A"),
            StateKey::config(id, "B")
        );
    }
}
