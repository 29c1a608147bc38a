//! Append-only per-task event log (`log.jsonl`).
//!
//! One compact JSON object per line, never rewritten or truncated, safe to
//! tail live. This trail is for external auditing; the in-record `history`
//! lists are what the engine reasons over.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::model::now_string;

use super::StoreError;

/// One structured log line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub time: String,
    pub event: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtasks_done: Option<String>,
}

impl LogEvent {
    pub fn new(event: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            time: now_string(),
            event: event.into(),
            task: task.into(),
            subtask: None,
            actor: None,
            agent: None,
            from: None,
            to: None,
            reason: None,
            note: None,
            status: None,
            subtasks_done: None,
        }
    }

    pub fn subtask(mut self, id: impl Into<String>) -> Self {
        self.subtask = Some(id.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn transition(mut self, from: impl ToString, to: impl ToString) -> Self {
        self.from = Some(from.to_string());
        self.to = Some(to.to_string());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn status(mut self, status: impl ToString) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn subtasks_done(mut self, done: usize, total: usize) -> Self {
        self.subtasks_done = Some(format!("{done}/{total}"));
        self
    }
}

/// Append one event to `<task_dir>/log.jsonl`.
pub fn append_log(task_dir: &Path, event: &LogEvent) -> Result<(), StoreError> {
    let path = task_dir.join("log.jsonl");
    let mut line = serde_json::to_string(event).map_err(|source| StoreError::Serialize {
        path: path.display().to_string(),
        source,
    })?;
    line.push('\n');
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
    file.write_all(line.as_bytes())
        .map_err(|source| StoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        append_log(dir.path(), &LogEvent::new("task.created", "TASK-001").actor("operator"))
            .unwrap();
        append_log(
            dir.path(),
            &LogEvent::new("subtask.dispatched", "TASK-001")
                .subtask("subtask_01")
                .agent("claude-code"),
        )
        .unwrap();

        let text = std::fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "task.created");
        assert!(first.get("subtask").is_none());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["agent"], "claude-code");
    }
}
