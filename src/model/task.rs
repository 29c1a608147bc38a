//! The top-level task record persisted as `task.json`.
//!
//! # Invariants
//! - `status` is only changed through the transition table in `crate::state`.
//! - `subtasks` holds ids of subtask records that exist on disk.
//! - Every mutation that matters for auditing goes through `add_history`.

use serde::{Deserialize, Serialize};

use super::history::HistoryEntry;
use super::now_string;
use super::status::{Priority, TaskStatus};

/// Schema discriminator written into every task record.
pub const TASK_SCHEMA: &str = "task-engine/task.v1";

fn task_schema() -> String {
    TASK_SCHEMA.to_string()
}

/// Plan summary plus approval trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approach: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<String>,
}

/// ETA and actual start/completion timestamps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timeline {
    /// Target date, `YYYY-MM-DD` or a full timestamp; overdue detection
    /// compares the date prefix only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

/// Free-form task metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

/// Notification-channel binding carried into the index for the formatter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelBinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// A unit of user-requested work, tracked through the 9-state lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "$schema", default = "task_schema")]
    pub schema: String,
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created: String,
    pub updated: String,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub discord: ChannelBinding,
    #[serde(default)]
    pub subtasks: Vec<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Task {
    /// Create a fresh task in `PLANNING`.
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        priority: Priority,
        description: impl Into<String>,
    ) -> Self {
        let now = now_string();
        Self {
            schema: task_schema(),
            id: id.into(),
            title: title.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Planning,
            created: now.clone(),
            updated: now,
            plan: Plan::default(),
            timeline: Timeline::default(),
            metadata: TaskMetadata::default(),
            discord: ChannelBinding::default(),
            subtasks: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Append an audit entry. The history list is append-only; nothing in
    /// the engine removes or rewrites entries.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_starts_in_planning() {
        let task = Task::new("TASK-001", "Add login", Priority::P1, "");
        assert_eq!(task.status, TaskStatus::Planning);
        assert_eq!(task.schema, TASK_SCHEMA);
        assert!(task.subtasks.is_empty());
    }

    #[test]
    fn serialize_deserialize_is_stable() {
        let mut task = Task::new("TASK-007", "Refactor", Priority::P0, "big one");
        task.plan.summary = Some("do it carefully".into());
        task.timeline.eta = Some("2026-09-01".into());
        task.add_history(HistoryEntry::new("created", "operator").with_to_status("PLANNING"));

        let first = serde_json::to_string_pretty(&task).unwrap();
        let back: Task = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&back).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("\"$schema\": \"task-engine/task.v1\""));
    }

    #[test]
    fn missing_optional_sections_default() {
        let json = r#"{
            "id": "TASK-002",
            "title": "Minimal",
            "priority": "P2",
            "status": "PLANNING",
            "created": "2026-08-01T00:00:00Z",
            "updated": "2026-08-01T00:00:00Z"
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert!(task.plan.summary.is_none());
        assert!(task.metadata.tags.is_empty());
        assert_eq!(task.schema, TASK_SCHEMA);
    }
}
