//! Parent/children record of one agent.

use crate::ids::AgentId;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// At most one parent and an insertion-ordered set of children.
///
/// Only changed through the explicit operations below; never inferred from
/// traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHierarchy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<AgentId>,
    #[serde(default)]
    pub children_ids: IndexSet<AgentId>,
}

impl AgentHierarchy {
    /// Returns false if the child was already present.
    pub fn add_child(&mut self, child: AgentId) -> bool {
        self.children_ids.insert(child)
    }

    /// Returns false if the child was not present.
    pub fn remove_child(&mut self, child: &AgentId) -> bool {
        self.children_ids.shift_remove(child)
    }

    pub fn set_parent(&mut self, parent: AgentId) -> Option<AgentId> {
        self.parent_id.replace(parent)
    }

    pub fn clear_parent(&mut self) -> Option<AgentId> {
        self.parent_id.take()
    }

    pub fn clear_children(&mut self) {
        self.children_ids.clear();
    }

    pub fn has_child(&self, child: &AgentId) -> bool {
        self.children_ids.contains(child)
    }
}
