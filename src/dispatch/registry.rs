//! Agent capability registry.
//!
//! The roster is plain data injected into the dispatcher at construction,
//! so tests can run against a fake roster without touching the default.

use serde::{Deserialize, Serialize};

use crate::model::SubtaskType;

/// One agent's declared capabilities and capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    /// Subtask types this agent can execute at all.
    pub capabilities: Vec<SubtaskType>,
    /// Subtask types this agent should get first pick of.
    #[serde(default)]
    pub preferred: Vec<SubtaskType>,
    /// Hard cap on concurrently IN_PROGRESS subtasks across all tasks.
    pub max_parallel: usize,
    /// How dispatch reaches the agent ("cli", "api", ...).
    pub dispatch_method: String,
}

impl AgentSpec {
    pub fn can_handle(&self, kind: SubtaskType) -> bool {
        self.capabilities.contains(&kind)
    }

    pub fn prefers(&self, kind: SubtaskType) -> bool {
        self.preferred.contains(&kind)
    }
}

/// Registered agents plus the fallback used when nothing else matches.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentSpec>,
    fallback: String,
}

impl AgentRegistry {
    pub fn new(agents: Vec<AgentSpec>, fallback: impl Into<String>) -> Self {
        Self {
            agents,
            fallback: fallback.into(),
        }
    }

    /// The stock roster.
    pub fn with_defaults() -> Self {
        use SubtaskType::*;
        Self::new(
            vec![
                AgentSpec {
                    id: "claude-code".into(),
                    capabilities: vec![Dev, Test, Docs, Misc],
                    preferred: vec![Dev],
                    max_parallel: 2,
                    dispatch_method: "cli".into(),
                },
                AgentSpec {
                    id: "codex".into(),
                    capabilities: vec![Dev, Misc],
                    preferred: vec![],
                    max_parallel: 2,
                    dispatch_method: "cli".into(),
                },
                AgentSpec {
                    id: "test-runner".into(),
                    capabilities: vec![Test, Validate],
                    preferred: vec![Test, Validate],
                    max_parallel: 4,
                    dispatch_method: "cli".into(),
                },
                AgentSpec {
                    id: "doc-writer".into(),
                    capabilities: vec![Docs],
                    preferred: vec![Docs],
                    max_parallel: 2,
                    dispatch_method: "cli".into(),
                },
            ],
            "claude-code",
        )
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    /// Pick an agent for a subtask type. Resolution order is policy:
    /// explicit request (if capable) beats preferred beats merely-capable
    /// beats the fallback.
    pub fn select_agent(&self, kind: SubtaskType, requested: Option<&str>) -> &str {
        if let Some(id) = requested {
            if let Some(agent) = self.get(id) {
                if agent.can_handle(kind) {
                    return &agent.id;
                }
            }
        }
        if let Some(agent) = self.agents.iter().find(|a| a.prefers(kind)) {
            return &agent.id;
        }
        if let Some(agent) = self.agents.iter().find(|a| a.can_handle(kind)) {
            return &agent.id;
        }
        &self.fallback
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
