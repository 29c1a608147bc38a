//! Pure transition tables for the task and subtask lifecycles.
//!
//! No I/O and no mutation: callers validate here, then commit through the
//! store under the task's lock. A `(status, event)` pair absent from the
//! table is invalid — validation returns `None` and the caller must treat
//! that as an error, never substitute a "closest" state.

use crate::model::{Subtask, SubtaskStatus, SubtaskType, TaskStatus};

/// Events that can advance a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskEvent {
    Approve,
    Reject,
    Start,
    Test,
    Block,
    Fail,
    Review,
    Reopen,
    Complete,
    Unblock,
}

impl TaskEvent {
    pub const ALL: [TaskEvent; 10] = [
        Self::Approve,
        Self::Reject,
        Self::Start,
        Self::Test,
        Self::Block,
        Self::Fail,
        Self::Review,
        Self::Reopen,
        Self::Complete,
        Self::Unblock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Start => "start",
            Self::Test => "test",
            Self::Block => "block",
            Self::Fail => "fail",
            Self::Review => "review",
            Self::Reopen => "reopen",
            Self::Complete => "complete",
            Self::Unblock => "unblock",
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|e| e.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task event: {s}"))
    }
}

/// Events that can advance a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubtaskEvent {
    Assign,
    Start,
    Done,
    Fail,
    Block,
    Unblock,
}

impl SubtaskEvent {
    pub const ALL: [SubtaskEvent; 6] = [
        Self::Assign,
        Self::Start,
        Self::Done,
        Self::Fail,
        Self::Block,
        Self::Unblock,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assign => "assign",
            Self::Start => "start",
            Self::Done => "done",
            Self::Fail => "fail",
            Self::Block => "block",
            Self::Unblock => "unblock",
        }
    }
}

impl std::fmt::Display for SubtaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubtaskEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|e| e.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown subtask event: {s}"))
    }
}

/// Look up the task transition table. `None` means the pair is invalid.
pub fn validate_task_transition(status: TaskStatus, event: TaskEvent) -> Option<TaskStatus> {
    use TaskEvent as E;
    use TaskStatus as S;
    match (status, event) {
        (S::Planning, E::Approve) => Some(S::Approved),
        (S::Planning, E::Reject) => Some(S::Rejected),
        (S::Approved, E::Start) => Some(S::InProgress),
        (S::InProgress, E::Test) => Some(S::Testing),
        (S::InProgress, E::Block) => Some(S::Blocked),
        (S::InProgress, E::Fail) => Some(S::Failed),
        (S::Testing, E::Review) => Some(S::Review),
        (S::Testing, E::Reopen) => Some(S::InProgress),
        (S::Testing, E::Fail) => Some(S::Failed),
        (S::Review, E::Complete) => Some(S::Completed),
        (S::Review, E::Reopen) => Some(S::InProgress),
        (S::Review, E::Fail) => Some(S::Failed),
        (S::Blocked, E::Unblock) => Some(S::InProgress),
        (S::Blocked, E::Fail) => Some(S::Failed),
        _ => None,
    }
}

/// Look up the subtask transition table. `None` means the pair is invalid.
pub fn validate_subtask_transition(
    status: SubtaskStatus,
    event: SubtaskEvent,
) -> Option<SubtaskStatus> {
    use SubtaskEvent as E;
    use SubtaskStatus as S;
    match (status, event) {
        (S::Pending, E::Assign) => Some(S::Assigned),
        (S::Assigned, E::Start) => Some(S::InProgress),
        (S::InProgress, E::Done) => Some(S::Done),
        (S::InProgress, E::Fail) => Some(S::Failed),
        (S::InProgress, E::Block) => Some(S::Blocked),
        (S::Assigned, E::Block) => Some(S::Blocked),
        (S::Blocked, E::Unblock) => Some(S::Assigned),
        _ => None,
    }
}

/// Events that are legal from the given task status.
pub fn valid_task_events(status: TaskStatus) -> Vec<TaskEvent> {
    TaskEvent::ALL
        .iter()
        .copied()
        .filter(|e| validate_task_transition(status, *e).is_some())
        .collect()
}

/// Events that are legal from the given subtask status.
pub fn valid_subtask_events(status: SubtaskStatus) -> Vec<SubtaskEvent> {
    SubtaskEvent::ALL
        .iter()
        .copied()
        .filter(|e| validate_subtask_transition(status, *e).is_some())
        .collect()
}

/// An engine-initiated task transition, with the reason that triggered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTransition {
    pub event: TaskEvent,
    pub reason: String,
}

/// Decide whether a task should silently advance based on its subtasks.
///
/// - `IN_PROGRESS` and all `dev` subtasks done (at least one exists) → `test`
/// - `TESTING` and all `test`/`validate` subtasks done (at least one exists)
///   → `review`
///
/// An empty set of the relevant type never counts as "all done". Callers
/// MUST re-evaluate this under the task's lock immediately before
/// committing; the subtask set may change between an unlocked read and
/// lock acquisition.
pub fn check_auto_transition(status: TaskStatus, subtasks: &[Subtask]) -> Option<AutoTransition> {
    match status {
        TaskStatus::InProgress => {
            let dev: Vec<&Subtask> = subtasks
                .iter()
                .filter(|s| s.kind == SubtaskType::Dev)
                .collect();
            if !dev.is_empty() && dev.iter().all(|s| s.status == SubtaskStatus::Done) {
                return Some(AutoTransition {
                    event: TaskEvent::Test,
                    reason: format!("all {} dev subtasks done", dev.len()),
                });
            }
            None
        }
        TaskStatus::Testing => {
            let checks: Vec<&Subtask> = subtasks
                .iter()
                .filter(|s| matches!(s.kind, SubtaskType::Test | SubtaskType::Validate))
                .collect();
            if !checks.is_empty() && checks.iter().all(|s| s.status == SubtaskStatus::Done) {
                return Some(AutoTransition {
                    event: TaskEvent::Review,
                    reason: format!("all {} test/validate subtasks done", checks.len()),
                });
            }
            None
        }
        _ => None,
    }
}
