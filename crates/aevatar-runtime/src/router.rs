//! Hierarchical propagation decisions.
//!
//! The router never performs I/O. It turns an envelope into a [`RoutePlan`]
//! which the agent then executes hop by hop through its transport.

use aevatar_protocol::{
    AgentEvent, AgentHierarchy, AgentId, Direction, EventEnvelope, KernelResult, SkipReason,
    TypedPayload,
};
use tracing::debug;

use crate::config::RuntimeConfig;

/// One hop the agent should issue.
#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub target: AgentId,
    pub envelope: EventEnvelope,
}

/// What to do with an envelope at this agent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePlan {
    /// Delivered to this agent's own handlers, at most once.
    pub local: Option<EventEnvelope>,
    pub forwards: Vec<Forward>,
    pub skipped: Vec<(AgentId, SkipReason)>,
}

impl RoutePlan {
    pub fn targets(&self) -> Vec<&AgentId> {
        self.forwards.iter().map(|forward| &forward.target).collect()
    }
}

#[derive(Debug, Clone)]
pub struct EventRouter {
    agent_id: AgentId,
    hierarchy: AgentHierarchy,
    config: RuntimeConfig,
}

impl EventRouter {
    pub fn new(agent_id: AgentId, config: RuntimeConfig) -> Self {
        Self {
            agent_id,
            hierarchy: AgentHierarchy::default(),
            config,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn hierarchy(&self) -> &AgentHierarchy {
        &self.hierarchy
    }

    pub(crate) fn hierarchy_mut(&mut self) -> &mut AgentHierarchy {
        &mut self.hierarchy
    }

    pub(crate) fn replace_hierarchy(&mut self, hierarchy: AgentHierarchy) {
        self.hierarchy = hierarchy;
    }

    pub fn parent(&self) -> Option<&AgentId> {
        self.hierarchy.parent_id.as_ref()
    }

    pub fn children(&self) -> impl Iterator<Item = &AgentId> {
        self.hierarchy.children_ids.iter()
    }

    pub fn create_envelope<E: AgentEvent>(
        &self,
        event: &E,
        direction: Direction,
    ) -> KernelResult<EventEnvelope> {
        Ok(EventEnvelope::new(
            self.agent_id.clone(),
            TypedPayload::encode(event)?,
            direction,
            self.config.default_max_hop_count,
        ))
    }

    /// Plan for an envelope this agent publishes: self first, then the hops.
    pub fn route_event(&self, envelope: &EventEnvelope) -> RoutePlan {
        let mut plan = RoutePlan {
            local: Some(envelope.clone()),
            ..RoutePlan::default()
        };
        self.plan_hops(envelope, &mut plan);
        plan
    }

    /// Plan for an envelope received from elsewhere: one more hop onward.
    pub fn continue_propagation(&self, envelope: &EventEnvelope) -> RoutePlan {
        let mut plan = RoutePlan::default();
        if envelope.should_stop_propagation {
            debug!(envelope_id = %envelope.id, agent_id = %self.agent_id, "propagation stopped");
            return plan;
        }
        self.plan_hops(envelope, &mut plan);
        plan
    }

    pub fn should_process_event(&self, envelope: &EventEnvelope) -> bool {
        if envelope.should_stop_propagation {
            return false;
        }
        let hops = envelope.current_hop_count;
        if envelope.max_hop_count > 0 && hops > envelope.max_hop_count {
            return false;
        }
        if hops > self.config.hop_safety_ceiling {
            return false;
        }
        envelope.min_hop_count == 0 || hops >= envelope.min_hop_count
    }

    fn hop_limit_reached(&self, envelope: &EventEnvelope) -> bool {
        let hops = envelope.current_hop_count;
        (envelope.max_hop_count > 0 && hops >= envelope.max_hop_count)
            || hops >= self.config.hop_safety_ceiling
    }

    fn plan_hops(&self, envelope: &EventEnvelope, plan: &mut RoutePlan) {
        match envelope.direction {
            Direction::Up => self.plan_up(envelope, plan),
            Direction::Down => self.plan_down(envelope, plan),
            // Split into independent clones; each obeys the same limits.
            Direction::Both => {
                self.plan_up(envelope, plan);
                self.plan_down(envelope, plan);
            }
        }
    }

    fn plan_up(&self, envelope: &EventEnvelope, plan: &mut RoutePlan) {
        if let Some(parent) = self.hierarchy.parent_id.as_ref() {
            self.plan_hop(parent, envelope, Direction::Up, plan);
        }
    }

    fn plan_down(&self, envelope: &EventEnvelope, plan: &mut RoutePlan) {
        for child in &self.hierarchy.children_ids {
            self.plan_hop(child, envelope, Direction::Down, plan);
        }
    }

    fn plan_hop(
        &self,
        target: &AgentId,
        envelope: &EventEnvelope,
        direction: Direction,
        plan: &mut RoutePlan,
    ) {
        let reason = if *target == self.agent_id {
            Some(SkipReason::SelfTarget)
        } else if envelope.has_visited(target) {
            Some(SkipReason::Cycle)
        } else if self.hop_limit_reached(envelope) {
            Some(SkipReason::HopLimit)
        } else {
            None
        };
        match reason {
            Some(reason) => {
                debug!(
                    envelope_id = %envelope.id,
                    agent_id = %self.agent_id,
                    target = %target,
                    hops = envelope.current_hop_count,
                    reason = %reason,
                    "hop skipped"
                );
                plan.skipped.push((target.clone(), reason));
            }
            None => plan.forwards.push(Forward {
                target: target.clone(),
                envelope: envelope.forwarded_by(&self.agent_id, direction),
            }),
        }
    }
}
