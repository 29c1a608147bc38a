//! Append-only audit entries attached to tasks and subtasks.

use serde::{Deserialize, Serialize};

use super::now_string;

/// One immutable audit record.
///
/// `from_status`/`to_status` are stored as plain strings because a single
/// history list may carry both task- and subtask-level statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub time: String,
    pub event: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl HistoryEntry {
    /// Create an entry stamped with the current time.
    pub fn new(event: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            time: now_string(),
            event: event.into(),
            actor: actor.into(),
            from_status: None,
            to_status: None,
            note: None,
            progress: None,
            context: None,
        }
    }

    pub fn with_transition(mut self, from: impl ToString, to: impl ToString) -> Self {
        self.from_status = Some(from.to_string());
        self.to_status = Some(to.to_string());
        self
    }

    pub fn with_to_status(mut self, to: impl ToString) -> Self {
        self.to_status = Some(to.to_string());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_progress(mut self, progress: i64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let entry = HistoryEntry::new("created", "operator");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("from_status"));
        assert!(!json.contains("progress"));
        assert!(json.contains("\"event\":\"created\""));
    }

    #[test]
    fn transition_entry_carries_both_statuses() {
        let entry = HistoryEntry::new("transition", "user")
            .with_transition("PLANNING", "APPROVED")
            .with_note("looks good");
        assert_eq!(entry.from_status.as_deref(), Some("PLANNING"));
        assert_eq!(entry.to_status.as_deref(), Some("APPROVED"));
    }
}
