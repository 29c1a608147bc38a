//! The heartbeat scanner.
//!
//! Invoked on a fixed interval by an external scheduler; each run scans
//! the index, audits every active task for stuck/slow subtasks and
//! overdue deadlines, records a heartbeat data point on each active
//! subtask, and commits eligible auto-transitions. No state persists
//! between runs.
//!
//! Auto-transitions follow the double-check pattern: eligibility is
//! evaluated once on an unlocked snapshot, then re-evaluated on fresh
//! state under the task's lock immediately before commit. The unlocked
//! result is only a hint.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::model::{HistoryEntry, Subtask, SubtaskStatus, Task};
use crate::state::check_auto_transition;
use crate::store::{LogEvent, StoreError, TaskStore};

/// Classification of a subtask's recent heartbeat window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StuckState {
    Normal,
    Slow,
    Stuck,
}

/// Alert categories emitted by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Overdue,
    Stuck,
    Slow,
    Failed,
    Transition,
    NotFound,
    Error,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overdue => "OVERDUE",
            Self::Stuck => "STUCK",
            Self::Slow => "SLOW",
            Self::Failed => "FAILED",
            Self::Transition => "TRANSITION",
            Self::NotFound => "NOT_FOUND",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured alert handed to the notification layer.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<i64>,
}

impl Alert {
    fn new(alert_type: AlertType, task_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            task_id: task_id.into(),
            subtask_id: None,
            message: message.into(),
            agent: None,
            progress: None,
        }
    }

    fn for_subtask(mut self, subtask: &Subtask) -> Self {
        self.subtask_id = Some(subtask.id.clone());
        self.agent = subtask.assignment.agent.clone();
        self.progress = Some(subtask.progress.percent);
        self
    }
}

/// Result of checking one task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskCheck {
    pub task_id: String,
    /// Task status string, or `NOT_FOUND` / `ERROR` for tasks that could
    /// not be audited.
    pub status: String,
    pub alerts: Vec<Alert>,
    pub subtasks_done: usize,
    pub subtask_total: usize,
}

/// Aggregate result of a full sweep.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub alerts: Vec<Alert>,
    pub summary: String,
    pub all_ok: bool,
    pub active_count: usize,
    pub stuck_count: usize,
    pub tasks: Vec<TaskCheck>,
}

/// Classify a subtask from the tail of its heartbeat history.
///
/// With fewer than `stale_beats` heartbeat entries there is not enough
/// data, so the answer is `Normal`. Otherwise the oldest and newest
/// entries of that window are compared: zero percent movement with an
/// unchanged checkpoint is `Stuck`; positive movement below
/// `progress_threshold` is `Slow`. A changed checkpoint is qualitative
/// progress and never stuck, even at 0%.
pub fn detect_stuck(subtask: &Subtask, config: &EngineConfig) -> StuckState {
    if config.stale_beats == 0 {
        // A zero-width window can never witness staleness.
        return StuckState::Normal;
    }
    let beats: Vec<&HistoryEntry> = subtask.heartbeat_history().collect();
    if beats.len() < config.stale_beats {
        return StuckState::Normal;
    }
    let window = &beats[beats.len() - config.stale_beats..];
    let oldest = window[0];
    let newest = window[window.len() - 1];

    let delta = newest.progress.unwrap_or(0) - oldest.progress.unwrap_or(0);
    let checkpoint_changed = oldest.context != newest.context;

    if delta == 0 && !checkpoint_changed {
        StuckState::Stuck
    } else if delta > 0 && delta < config.progress_threshold {
        StuckState::Slow
    } else {
        StuckState::Normal
    }
}

/// True iff the task has an ETA and today is strictly past its
/// `YYYY-MM-DD` prefix. No ETA means never overdue.
pub fn detect_overdue(task: &Task) -> bool {
    let Some(eta) = &task.timeline.eta else {
        return false;
    };
    // Character prefix, not bytes: ETAs are free-form user input.
    let eta_date: String = eta.chars().take(10).collect();
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    today > eta_date
}

/// Audit one task: overdue check, per-subtask stuck detection plus a
/// heartbeat data point, standing FAILED alerts, then the locked
/// auto-transition commit. A task id that resolves nowhere yields a
/// NOT_FOUND result, not an error.
pub fn check_single_task(
    store: &TaskStore,
    task_id: &str,
    config: &EngineConfig,
) -> Result<TaskCheck, StoreError> {
    let Some(task) = store.read_task(task_id)? else {
        return Ok(TaskCheck {
            task_id: task_id.to_string(),
            status: "NOT_FOUND".into(),
            alerts: vec![Alert::new(
                AlertType::NotFound,
                task_id,
                format!("task {task_id} not found"),
            )],
            subtasks_done: 0,
            subtask_total: 0,
        });
    };

    let mut alerts = Vec::new();
    if detect_overdue(&task) {
        let eta = task.timeline.eta.clone().unwrap_or_default();
        alerts.push(Alert::new(
            AlertType::Overdue,
            task_id,
            format!("{} past its ETA {}", task_id, eta),
        ));
    }

    let subtasks = store.read_all_subtasks(task_id)?;
    for subtask in &subtasks {
        if subtask.status == SubtaskStatus::Failed {
            // Standing alert until the failure is resolved, not
            // edge-triggered on the transition.
            alerts.push(
                Alert::new(
                    AlertType::Failed,
                    task_id,
                    format!(
                        "{} failed: {}",
                        subtask.id,
                        subtask.result.error.as_deref().unwrap_or("no error recorded")
                    ),
                )
                .for_subtask(subtask),
            );
            continue;
        }
        if !subtask.status.is_active() {
            continue;
        }

        match detect_stuck(subtask, config) {
            StuckState::Stuck => alerts.push(
                Alert::new(
                    AlertType::Stuck,
                    task_id,
                    format!(
                        "{} stuck at {}% for {} checks",
                        subtask.id, subtask.progress.percent, config.stale_beats
                    ),
                )
                .for_subtask(subtask),
            ),
            StuckState::Slow => alerts.push(
                Alert::new(
                    AlertType::Slow,
                    task_id,
                    format!("{} progressing slowly ({}%)", subtask.id, subtask.progress.percent),
                )
                .for_subtask(subtask),
            ),
            StuckState::Normal => {}
        }

        // Every check is also a data point; the detection window only
        // accumulates because each sweep appends one of these.
        let mut fresh = subtask.clone();
        let mut beat =
            HistoryEntry::new("heartbeat", "heartbeat").with_progress(fresh.progress.percent);
        if let Some(checkpoint) = &fresh.progress.checkpoint {
            beat = beat.with_context(checkpoint.clone());
        }
        fresh.add_history(beat);
        store.save_subtask(&fresh)?;
    }

    if config.auto_transition {
        // Cheap unlocked pre-check; the locked re-evaluation is the one
        // that decides.
        if check_auto_transition(task.status, &subtasks).is_some() {
            let _guard = store.lock_task(task_id)?;
            if let Some(applied) = store.apply_auto_transition_locked(task_id, "heartbeat")? {
                alerts.push(Alert::new(
                    AlertType::Transition,
                    task_id,
                    format!("{} auto-transitioned {} -> {} ({})", task_id, applied.from, applied.to, applied.reason),
                ));
            }
        }
    }

    // Re-read: the auto-transition path above may have changed the task.
    let task = store.require_task(task_id)?;
    let done = store.count_done_subtasks(task_id)?;
    let total = task.subtasks.len();
    store.update_index_entry(task_id, |e| {
        e.status = task.status;
        e.subtasks_done = done;
        e.subtask_count = total;
    })?;
    store.append_task_log(
        task_id,
        &LogEvent::new("heartbeat.check", task_id)
            .status(task.status)
            .subtasks_done(done, total),
    )?;

    Ok(TaskCheck {
        task_id: task_id.to_string(),
        status: task.status.to_string(),
        alerts,
        subtasks_done: done,
        subtask_total: total,
    })
}

/// Sweep every non-terminal task. One task's failure never aborts the
/// batch: it becomes an ERROR entry and the loop continues.
pub fn check_all_tasks(store: &TaskStore, config: &EngineConfig) -> Result<CheckReport, StoreError> {
    let entries = store.list_tasks(false)?;
    let active_count = entries.len();
    let mut tasks = Vec::with_capacity(active_count);
    let mut alerts = Vec::new();

    for entry in entries {
        match check_single_task(store, &entry.id, config) {
            Ok(check) => {
                alerts.extend(check.alerts.iter().cloned());
                tasks.push(check);
            }
            Err(err) => {
                warn!("check of {} failed: {}", entry.id, err);
                let alert = Alert::new(
                    AlertType::Error,
                    &entry.id,
                    format!("check failed: {err}"),
                );
                alerts.push(alert.clone());
                tasks.push(TaskCheck {
                    task_id: entry.id.clone(),
                    status: "ERROR".into(),
                    alerts: vec![alert],
                    subtasks_done: 0,
                    subtask_total: 0,
                });
            }
        }
    }

    let stuck_count = alerts
        .iter()
        .filter(|a| a.alert_type == AlertType::Stuck)
        .count();
    let all_ok = alerts.is_empty();
    let summary = format!(
        "{} active task(s), {} alert(s), {} stuck",
        active_count,
        alerts.len(),
        stuck_count
    );
    info!("heartbeat sweep: {}", summary);

    Ok(CheckReport {
        alerts,
        summary,
        all_ok,
        active_count,
        stuck_count,
        tasks,
    })
}
