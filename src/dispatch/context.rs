//! Dispatch-context assembly and prompt templating.
//!
//! Everything a worker needs to execute a subtask, bundled once at
//! dispatch time: the work itself, what its dependencies produced, the
//! constraints implied by the parent's tags, and where to do it.

use serde::Serialize;

use crate::model::{Subtask, SubtaskStatus, Task};

use super::registry::AgentSpec;

/// Status and outcome of one dependency, resolved from its record.
#[derive(Debug, Clone, Serialize)]
pub struct DependencySummary {
    pub id: String,
    pub title: String,
    pub status: SubtaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// The bundle handed across the dispatch boundary.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchContext {
    pub task_id: String,
    pub task_title: String,
    pub subtask_id: String,
    pub title: String,
    pub description: String,
    pub subtask_type: String,
    pub priority: String,
    pub dependencies: Vec<DependencySummary>,
    /// Derived from the parent task's tags.
    pub constraints: Vec<String>,
    /// Suggested working-directory name for the agent.
    pub workspace: String,
    pub agent: String,
    pub dispatch_method: String,
}

impl DispatchContext {
    /// Assemble the context for `subtask` under `task`, resolving
    /// dependency ids against `all_subtasks`.
    pub fn build(task: &Task, subtask: &Subtask, all_subtasks: &[Subtask], agent: &AgentSpec) -> Self {
        let dependencies = subtask
            .dependencies
            .iter()
            .filter_map(|dep_id| all_subtasks.iter().find(|s| &s.id == dep_id))
            .map(|dep| DependencySummary {
                id: dep.id.clone(),
                title: dep.title.clone(),
                status: dep.status,
                summary: dep.result.summary.clone(),
            })
            .collect();

        let constraints = task
            .metadata
            .tags
            .iter()
            .filter_map(|tag| constraint_for_tag(tag))
            .collect();

        Self {
            task_id: task.id.clone(),
            task_title: task.title.clone(),
            subtask_id: subtask.id.clone(),
            title: subtask.title.clone(),
            description: subtask.description.clone(),
            subtask_type: subtask.kind.to_string(),
            priority: subtask.priority.to_string(),
            dependencies,
            constraints,
            workspace: format!("{}-{}", task.id.to_lowercase(), subtask.id),
            agent: agent.id.clone(),
            dispatch_method: agent.dispatch_method.clone(),
        }
    }

    /// Render a self-contained instruction block for a text-driven worker.
    /// Pure templating; every decision was made before this point.
    pub fn prompt(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "# {} / {}: {}\n\n",
            self.task_id, self.subtask_id, self.title
        ));
        out.push_str(&format!(
            "Task: {} (priority {}, type {})\n\n",
            self.task_title, self.priority, self.subtask_type
        ));
        if !self.description.is_empty() {
            out.push_str(&format!("## Description\n{}\n\n", self.description));
        }
        if !self.dependencies.is_empty() {
            out.push_str("## Completed dependencies\n");
            for dep in &self.dependencies {
                match &dep.summary {
                    Some(summary) => {
                        out.push_str(&format!("- {} ({}): {} — {}\n", dep.id, dep.status, dep.title, summary))
                    }
                    None => out.push_str(&format!("- {} ({}): {}\n", dep.id, dep.status, dep.title)),
                }
            }
            out.push('\n');
        }
        if !self.constraints.is_empty() {
            out.push_str("## Constraints\n");
            for c in &self.constraints {
                out.push_str(&format!("- {c}\n"));
            }
            out.push('\n');
        }
        out.push_str(&format!("## Workspace\nWork in `{}`.\n\n", self.workspace));
        out.push_str(&format!(
            "Report progress with checkpoint labels as you go. When finished, \
             report DONE with a one-line summary, or FAILED with the error.\n"
        ));
        out
    }
}

fn constraint_for_tag(tag: &str) -> Option<String> {
    match tag {
        "no-deps" => Some("Do not add new third-party dependencies.".into()),
        "hotfix" => Some("Minimal diff only; no refactoring.".into()),
        "breaking-ok" => Some("Breaking API changes are acceptable.".into()),
        "tests-required" => Some("Every change needs an accompanying test.".into()),
        _ => None,
    }
}
