//! Locked read-modify-write operations.
//!
//! Everything here holds the task's exclusive lock across the whole
//! sequence: read fresh state, validate against the transition tables,
//! mutate, persist, update the index, and append the log event. Unlocked
//! callers must re-validate through these entry points before any write.

use tracing::info;

use crate::model::{
    now_string, HistoryEntry, Subtask, SubtaskStatus, TaskStatus,
};
use crate::state::{
    check_auto_transition, validate_subtask_transition, validate_task_transition, SubtaskEvent,
    TaskEvent,
};

use super::{LogEvent, NewSubtask, StoreError, TaskStore};

/// A committed task-status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// An auto-transition the engine committed on the parent task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAutoTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
}

/// Result of applying a subtask event.
#[derive(Debug, Clone)]
pub struct SubtaskEventOutcome {
    pub from: SubtaskStatus,
    pub to: SubtaskStatus,
    /// Set when completing/failing this subtask advanced the parent.
    pub auto_transition: Option<AppliedAutoTransition>,
}

impl TaskStore {
    /// Apply a named event to a task under its lock.
    ///
    /// Side effects mirror the lifecycle: approval stamps the plan,
    /// blocking records the reason, unblocking clears it, and terminal
    /// statuses stamp `completed_at`.
    ///
    /// # Errors
    /// `StoreError::InvalidTransition` when the (status, event) pair is not
    /// in the table — the task is left untouched.
    pub fn transition_task(
        &self,
        task_id: &str,
        event: TaskEvent,
        actor: &str,
        note: Option<&str>,
    ) -> Result<TaskTransition, StoreError> {
        let _guard = self.lock_task(task_id)?;

        let mut task = self.require_task(task_id)?;
        let new_status = validate_task_transition(task.status, event).ok_or_else(|| {
            StoreError::InvalidTransition {
                status: task.status.to_string(),
                event: event.to_string(),
            }
        })?;

        let old_status = task.status;
        task.status = new_status;
        let mut entry = HistoryEntry::new("transition", actor).with_transition(old_status, new_status);
        if let Some(note) = note {
            entry = entry.with_note(note);
        }
        task.add_history(entry);

        if new_status == TaskStatus::Approved && note.is_some() {
            task.plan.approved_by = Some("human".to_string());
            task.plan.approved_at = Some(now_string());
        }
        if new_status == TaskStatus::Blocked {
            task.metadata.blocked_reason = note.map(str::to_string);
        }
        if new_status == TaskStatus::InProgress && old_status == TaskStatus::Blocked {
            task.metadata.blocked_reason = None;
        }
        if new_status == TaskStatus::InProgress && task.timeline.started_at.is_none() {
            task.timeline.started_at = Some(now_string());
        }
        if new_status.is_terminal() {
            task.timeline.completed_at = Some(now_string());
        }

        self.save_task(&mut task)?;
        self.update_index_entry(task_id, |e| e.status = new_status)?;

        let mut log = LogEvent::new(format!("task.{event}"), task_id)
            .transition(old_status, new_status)
            .actor(actor);
        if let Some(note) = note {
            log = log.note(note);
        }
        self.append_task_log(task_id, &log)?;

        info!("{}: {} -> {} ({})", task_id, old_status, new_status, event);
        Ok(TaskTransition {
            from: old_status,
            to: new_status,
        })
    }

    /// Apply a named event to a subtask under the parent task's lock,
    /// recording progress, cascading unblocks, and evaluating the parent's
    /// auto-transition when the subtask reaches a terminal status.
    pub fn apply_subtask_event(
        &self,
        task_id: &str,
        subtask_id: &str,
        event: SubtaskEvent,
        note: Option<&str>,
        progress: Option<i64>,
    ) -> Result<SubtaskEventOutcome, StoreError> {
        let _guard = self.lock_task(task_id)?;

        let mut subtask = self.require_subtask(task_id, subtask_id)?;
        let new_status = validate_subtask_transition(subtask.status, event).ok_or_else(|| {
            StoreError::InvalidTransition {
                status: subtask.status.to_string(),
                event: event.to_string(),
            }
        })?;

        let old_status = subtask.status;
        subtask.status = new_status;

        if let Some(percent) = progress {
            subtask.progress.percent = percent;
            subtask.progress.last_update = Some(now_string());
        }
        if let Some(note) = note {
            subtask.progress.checkpoint = Some(note.to_string());
        }
        match new_status {
            SubtaskStatus::Done => {
                subtask.progress.percent = 100;
                subtask.progress.last_update = Some(now_string());
                subtask.result.status = Some("success".to_string());
                if let Some(note) = note {
                    subtask.result.summary = Some(note.to_string());
                }
            }
            SubtaskStatus::Failed => {
                subtask.result.status = Some("failed".to_string());
                if let Some(note) = note {
                    subtask.result.error = Some(note.to_string());
                }
            }
            _ => {}
        }

        let mut entry = HistoryEntry::new(event.as_str(), "agent");
        if let Some(note) = note {
            entry = entry.with_note(note);
        }
        if let Some(percent) = progress {
            entry = entry.with_progress(percent);
        }
        subtask.add_history(entry);
        self.save_subtask(&subtask)?;

        self.append_task_log(
            task_id,
            &LogEvent::new(format!("subtask.{event}"), task_id)
                .subtask(subtask_id)
                .transition(old_status, new_status),
        )?;

        let done = self.count_done_subtasks(task_id)?;
        let task = self.require_task(task_id)?;
        let total = task.subtasks.len();
        self.update_index_entry(task_id, |e| {
            e.subtasks_done = done;
            e.subtask_count = total;
        })?;

        let mut auto_applied = None;
        if new_status.is_terminal() {
            auto_applied = self.apply_auto_transition_locked(task_id, "system")?;
        }
        if new_status == SubtaskStatus::Done {
            self.unblock_dependents(task_id, subtask_id)?;
        }

        Ok(SubtaskEventOutcome {
            from: old_status,
            to: new_status,
            auto_transition: auto_applied,
        })
    }

    /// Create a subtask and, when the parent sits in APPROVED, auto-start
    /// it — first dispatch implies the work has begun. The whole sequence
    /// runs under the task's lock.
    pub fn dispatch_subtask(
        &self,
        task_id: &str,
        spec: NewSubtask,
    ) -> Result<(Subtask, Option<TaskTransition>), StoreError> {
        let _guard = self.lock_task(task_id)?;
        let subtask = self.create_subtask(task_id, spec)?;
        let started = self.auto_start_locked(task_id)?;
        Ok((subtask, started))
    }

    /// Commit an auto-dispatch decision: move a PENDING subtask to
    /// ASSIGNED with its dispatch context, then auto-start an APPROVED
    /// parent. Subtasks already ASSIGNED are re-dispatched without a
    /// status change.
    pub fn commit_auto_dispatch(
        &self,
        task_id: &str,
        subtask_id: &str,
        agent: &str,
        prompt: &str,
    ) -> Result<Option<TaskTransition>, StoreError> {
        let _guard = self.lock_task(task_id)?;

        let mut subtask = self.require_subtask(task_id, subtask_id)?;
        if subtask.status == SubtaskStatus::Pending {
            subtask.status = SubtaskStatus::Assigned;
            subtask.assignment.agent = Some(agent.to_string());
            subtask.assignment.assigned_at = Some(now_string());
            // The record keeps a prompt excerpt; the full text goes to the agent.
            subtask.assignment.dispatch_context = Some(truncate_chars(prompt, 500));
            subtask.add_history(
                HistoryEntry::new("assign", "dispatcher")
                    .with_note(format!("Auto-dispatched to {agent}")),
            );
            self.save_subtask(&subtask)?;
        }

        let started = self.auto_start_locked(task_id)?;

        self.append_task_log(
            task_id,
            &LogEvent::new("subtask.auto_dispatched", task_id)
                .subtask(subtask_id)
                .agent(agent),
        )?;
        Ok(started)
    }

    /// Re-check auto-transition eligibility on fresh state and commit it.
    /// Caller must hold the task's lock; this is the second half of the
    /// double-check pattern.
    pub(crate) fn apply_auto_transition_locked(
        &self,
        task_id: &str,
        actor: &str,
    ) -> Result<Option<AppliedAutoTransition>, StoreError> {
        let Some(mut task) = self.read_task(task_id)? else {
            return Ok(None);
        };
        let subtasks = self.read_all_subtasks(task_id)?;
        let Some(auto) = check_auto_transition(task.status, &subtasks) else {
            return Ok(None);
        };
        let Some(new_status) = validate_task_transition(task.status, auto.event) else {
            return Ok(None);
        };

        let old_status = task.status;
        task.status = new_status;
        task.add_history(
            HistoryEntry::new("transition", actor)
                .with_transition(old_status, new_status)
                .with_note(format!("Auto: {}", auto.reason)),
        );
        self.save_task(&mut task)?;
        self.update_index_entry(task_id, |e| e.status = new_status)?;
        self.append_task_log(
            task_id,
            &LogEvent::new("task.auto_transition", task_id)
                .transition(old_status, new_status)
                .reason(auto.reason.clone())
                .actor(actor),
        )?;

        info!(
            "auto-transition {}: {} -> {} ({})",
            task_id, old_status, new_status, auto.reason
        );
        Ok(Some(AppliedAutoTransition {
            from: old_status,
            to: new_status,
            reason: auto.reason,
        }))
    }

    /// Fire `start` on an APPROVED task. Caller must hold the lock.
    fn auto_start_locked(&self, task_id: &str) -> Result<Option<TaskTransition>, StoreError> {
        let Some(mut task) = self.read_task(task_id)? else {
            return Ok(None);
        };
        if task.status != TaskStatus::Approved {
            return Ok(None);
        }

        let old_status = task.status;
        task.status = TaskStatus::InProgress;
        task.timeline.started_at = Some(now_string());
        task.add_history(
            HistoryEntry::new("transition", "system")
                .with_transition(old_status, TaskStatus::InProgress)
                .with_note("Auto-started on first dispatch"),
        );
        self.save_task(&mut task)?;
        self.update_index_entry(task_id, |e| e.status = TaskStatus::InProgress)?;
        self.append_task_log(
            task_id,
            &LogEvent::new("task.auto_transition", task_id)
                .transition(old_status, TaskStatus::InProgress)
                .actor("system"),
        )?;

        Ok(Some(TaskTransition {
            from: old_status,
            to: TaskStatus::InProgress,
        }))
    }

    /// Completing `completed_id` may unblock siblings that were waiting on
    /// it: drop it from their `blocked_by` and, once empty, return them to
    /// ASSIGNED (agent already chosen) or PENDING.
    fn unblock_dependents(&self, task_id: &str, completed_id: &str) -> Result<(), StoreError> {
        let subtasks = self.read_all_subtasks(task_id)?;
        for mut st in subtasks {
            if st.status != SubtaskStatus::Blocked || !st.blocked_by.iter().any(|b| b == completed_id)
            {
                continue;
            }
            st.blocked_by.retain(|b| b != completed_id);
            if st.blocked_by.is_empty() {
                st.status = if st.assignment.agent.is_some() {
                    SubtaskStatus::Assigned
                } else {
                    SubtaskStatus::Pending
                };
                st.add_history(
                    HistoryEntry::new("unblock", "system")
                        .with_note(format!("Unblocked: {completed_id} completed")),
                );
                info!("unblocked {}/{}", task_id, st.id);
            }
            self.save_subtask(&st)?;
        }
        Ok(())
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, SubtaskType};
    use crate::store::test_store;

    fn approved_task(store: &TaskStore) -> String {
        let task = store.create_task("work", Priority::P1, None, "").unwrap();
        store
            .transition_task(&task.id, TaskEvent::Approve, "user", Some("ok"))
            .unwrap();
        task.id
    }

    #[test]
    fn transition_applies_table_and_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);

        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
        assert_eq!(task.plan.approved_by.as_deref(), Some("human"));
        assert_eq!(
            store.read_index().unwrap().entry(&task_id).unwrap().status,
            TaskStatus::Approved
        );

        store.transition_task(&task_id, TaskEvent::Start, "user", None).unwrap();
        let task = store.require_task(&task_id).unwrap();
        assert!(task.timeline.started_at.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected_without_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("planning", Priority::P1, None, "").unwrap();
        let err = store
            .transition_task(&task.id, TaskEvent::Complete, "user", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(store.require_task(&task.id).unwrap().status, TaskStatus::Planning);
    }

    #[test]
    fn block_and_unblock_manage_reason() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);
        store.transition_task(&task_id, TaskEvent::Start, "user", None).unwrap();
        store
            .transition_task(&task_id, TaskEvent::Block, "user", Some("waiting on creds"))
            .unwrap();
        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.metadata.blocked_reason.as_deref(), Some("waiting on creds"));

        store.transition_task(&task_id, TaskEvent::Unblock, "user", None).unwrap();
        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.metadata.blocked_reason.is_none());
    }

    #[test]
    fn terminal_transition_stamps_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);
        store.transition_task(&task_id, TaskEvent::Start, "user", None).unwrap();
        store.transition_task(&task_id, TaskEvent::Fail, "user", Some("nope")).unwrap();
        let task = store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.timeline.completed_at.is_some());
    }

    #[test]
    fn dispatch_auto_starts_approved_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);

        let (subtask, started) = store
            .dispatch_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                agent: Some("claude-code".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Assigned);
        let started = started.unwrap();
        assert_eq!(started.from, TaskStatus::Approved);
        assert_eq!(started.to, TaskStatus::InProgress);
    }

    #[test]
    fn subtask_done_cascades_auto_transition_and_unblock() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);
        let (dev, _) = store
            .dispatch_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                agent: Some("claude-code".into()),
                ..Default::default()
            })
            .unwrap();
        let tester = store
            .create_subtask(&task_id, NewSubtask {
                title: "verify".into(),
                kind: SubtaskType::Test,
                deps: vec![dev.id.clone()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(tester.status, SubtaskStatus::Blocked);

        store
            .apply_subtask_event(&task_id, &dev.id, SubtaskEvent::Start, None, Some(10))
            .unwrap();
        let outcome = store
            .apply_subtask_event(&task_id, &dev.id, SubtaskEvent::Done, Some("shipped"), None)
            .unwrap();

        // All dev subtasks done while IN_PROGRESS fires `test`.
        let auto = outcome.auto_transition.unwrap();
        assert_eq!(auto.from, TaskStatus::InProgress);
        assert_eq!(auto.to, TaskStatus::Testing);

        let dev_read = store.require_subtask(&task_id, &dev.id).unwrap();
        assert_eq!(dev_read.progress.percent, 100);
        assert_eq!(dev_read.result.status.as_deref(), Some("success"));
        assert_eq!(dev_read.result.summary.as_deref(), Some("shipped"));

        // Dependent returned to PENDING (no agent on it).
        let tester_read = store.require_subtask(&task_id, &tester.id).unwrap();
        assert_eq!(tester_read.status, SubtaskStatus::Pending);
        assert!(tester_read.blocked_by.is_empty());

        let entry = store.read_index().unwrap().entry(&task_id).cloned().unwrap();
        assert_eq!(entry.subtasks_done, 1);
        assert_eq!(entry.subtask_count, 2);
    }

    #[test]
    fn commit_auto_dispatch_assigns_pending_subtask() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);
        let st = store
            .create_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(st.status, SubtaskStatus::Pending);

        let started = store
            .commit_auto_dispatch(&task_id, &st.id, "claude-code", "do the thing")
            .unwrap();
        assert!(started.is_some());

        let read = store.require_subtask(&task_id, &st.id).unwrap();
        assert_eq!(read.status, SubtaskStatus::Assigned);
        assert_eq!(read.assignment.agent.as_deref(), Some("claude-code"));
        assert_eq!(read.assignment.dispatch_context.as_deref(), Some("do the thing"));
    }

    #[test]
    fn failed_subtask_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = approved_task(&store);
        let (st, _) = store
            .dispatch_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                agent: Some("claude-code".into()),
                ..Default::default()
            })
            .unwrap();
        store
            .apply_subtask_event(&task_id, &st.id, SubtaskEvent::Start, None, None)
            .unwrap();
        let outcome = store
            .apply_subtask_event(&task_id, &st.id, SubtaskEvent::Fail, Some("tests exploded"), None)
            .unwrap();
        assert_eq!(outcome.to, SubtaskStatus::Failed);
        // A failed dev subtask does not advance the parent.
        assert!(outcome.auto_transition.is_none());
        let read = store.require_subtask(&task_id, &st.id).unwrap();
        assert_eq!(read.result.error.as_deref(), Some("tests exploded"));
    }
}
