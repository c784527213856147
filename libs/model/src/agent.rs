//! Agent identity and registration model.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    New,
    Active,
    Error,
    Disabled,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::New => "NEW",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Error => "ERROR",
            AgentStatus::Disabled => "DISABLED",
        };
        write!(f, "{}", s)
    }
}

/// A registered reconciliation agent.
///
/// Capability and fact entries may be exact kinds (`"config"`) or glob-style
/// patterns (`"file_*"`); the scheduler matches target resources against
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub uuid: Uuid,
    pub name: String,

    /// The node this agent runs on.
    pub node: Uuid,

    /// Capability kinds (or patterns) this agent manages end-to-end.
    pub capabilities: Vec<String>,

    /// Fact kinds (or patterns) this agent observes.
    pub facts: Vec<String>,

    pub status: AgentStatus,
}

impl Agent {
    /// Build an agent identified by its node.
    ///
    /// Agents are one-per-node; the node uuid doubles as the agent uuid and
    /// the default name when none is given.
    pub fn from_node(
        node: Uuid,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
        facts: impl IntoIterator<Item = impl Into<String>>,
        name: Option<String>,
    ) -> Self {
        Self {
            uuid: node,
            name: name.unwrap_or_else(|| node.to_string()),
            node,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            facts: facts.into_iter().map(Into::into).collect(),
            status: AgentStatus::New,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.status == AgentStatus::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_node_defaults() {
        let node = Uuid::new_v4();
        let agent = Agent::from_node(node, ["file_*"], ["meminfo"], None);

        assert_eq!(agent.uuid, node);
        assert_eq!(agent.name, node.to_string());
        assert_eq!(agent.status, AgentStatus::New);
        assert_eq!(agent.capabilities, vec!["file_*".to_string()]);
    }

    #[test]
    fn test_status_serialization() {
        let s = serde_json::to_string(&AgentStatus::Disabled).unwrap();
        assert_eq!(s, "\"DISABLED\"");
        assert_eq!(AgentStatus::Disabled.to_string(), "DISABLED");
    }
}
