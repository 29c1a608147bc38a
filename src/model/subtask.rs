//! The dispatchable subtask record persisted as `subtask_NN.json`.

use serde::{Deserialize, Serialize};

use super::history::HistoryEntry;
use super::status::{Priority, SubtaskStatus, SubtaskType};

/// Schema discriminator written into every subtask record.
pub const SUBTASK_SCHEMA: &str = "task-engine/subtask.v1";

fn subtask_schema() -> String {
    SUBTASK_SCHEMA.to_string()
}

/// Who is running this subtask and how it was handed over.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch_context: Option<String>,
}

/// Last reported progress. The heartbeat scanner snapshots these fields
/// into the subtask history on every check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    #[serde(default)]
    pub percent: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

/// Outcome reported by the executing agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One dispatchable unit of work belonging to exactly one task.
///
/// # Invariants
/// - `dependencies` and `blocked_by` reference subtasks of the same parent.
/// - A subtask with unmet dependencies is `BLOCKED` or `PENDING`, never
///   `ASSIGNED`/`IN_PROGRESS`.
/// - `priority` is a snapshot of the parent's priority at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    #[serde(rename = "$schema", default = "subtask_schema")]
    pub schema: String,
    pub id: String,
    pub parent_task: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub kind: SubtaskType,
    pub status: SubtaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub assignment: Assignment,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub result: SubtaskResult,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl Subtask {
    /// Create a fresh subtask in `PENDING` with the parent's priority.
    pub fn new(
        id: impl Into<String>,
        parent_task: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        kind: SubtaskType,
        priority: Priority,
    ) -> Self {
        Self {
            schema: subtask_schema(),
            id: id.into(),
            parent_task: parent_task.into(),
            title: title.into(),
            description: description.into(),
            kind,
            status: SubtaskStatus::Pending,
            priority,
            assignment: Assignment::default(),
            dependencies: Vec::new(),
            blocked_by: Vec::new(),
            progress: Progress::default(),
            result: SubtaskResult::default(),
            history: Vec::new(),
        }
    }

    /// Append an audit entry (append-only, same discipline as `Task`).
    pub fn add_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Heartbeat entries recorded by the checker, oldest first.
    pub fn heartbeat_history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter().filter(|h| h.event == "heartbeat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_subtask_is_pending() {
        let st = Subtask::new("subtask_01", "TASK-001", "impl", "", SubtaskType::Dev, Priority::P1);
        assert_eq!(st.status, SubtaskStatus::Pending);
        assert_eq!(st.priority, Priority::P1);
        assert!(st.assignment.agent.is_none());
    }

    #[test]
    fn type_field_uses_wire_name() {
        let st = Subtask::new("subtask_02", "TASK-001", "verify", "", SubtaskType::Validate, Priority::P2);
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"type\":\"validate\""));
        assert!(json.contains("\"$schema\":\"task-engine/subtask.v1\""));
        let back: Subtask = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, SubtaskType::Validate);
    }

    #[test]
    fn heartbeat_history_filters_events() {
        let mut st = Subtask::new("subtask_01", "TASK-001", "x", "", SubtaskType::Dev, Priority::P1);
        st.add_history(HistoryEntry::new("created", "operator"));
        st.add_history(HistoryEntry::new("heartbeat", "heartbeat").with_progress(10));
        st.add_history(HistoryEntry::new("heartbeat", "heartbeat").with_progress(20));
        assert_eq!(st.heartbeat_history().count(), 2);
    }
}
