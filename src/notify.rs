//! Pure formatting for chat notifications.
//!
//! Turns engine data into human-readable message strings. No side
//! effects and no transport: the surrounding automation sends these
//! wherever the task's channel binding points.

use crate::checker::{Alert, AlertType, CheckReport};
use crate::model::{Subtask, SubtaskStatus, Task, TaskStatus};
use crate::store::{StoreError, TaskStore};

const PROGRESS_BAR_WIDTH: usize = 10;
const MAX_SUBTASKS_SHOWN: usize = 10;
const RULE: &str = "━━━━━━━━━━━━━━━━━━━━";

pub fn task_status_marker(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Planning => "📝",
        TaskStatus::Approved => "✅",
        TaskStatus::InProgress => "🔄",
        TaskStatus::Testing => "🧪",
        TaskStatus::Review => "👁️",
        TaskStatus::Completed => "✅",
        TaskStatus::Failed => "❌",
        TaskStatus::Rejected => "🚫",
        TaskStatus::Blocked => "⏸️",
    }
}

pub fn subtask_status_marker(status: SubtaskStatus) -> &'static str {
    match status {
        SubtaskStatus::Pending => "⏳",
        SubtaskStatus::Assigned => "📋",
        SubtaskStatus::InProgress => "🔄",
        SubtaskStatus::Done => "✅",
        SubtaskStatus::Failed => "❌",
        SubtaskStatus::Blocked => "⏸️",
    }
}

/// Text progress bar: `[████░░░░░░] 40%`.
pub fn progress_bar(percent: i64) -> String {
    let percent = percent.clamp(0, 100);
    let filled = ((PROGRESS_BAR_WIDTH as i64 * percent + 50) / 100) as usize;
    let empty = PROGRESS_BAR_WIDTH - filled;
    format!("[{}{}] {}%", "█".repeat(filled), "░".repeat(empty), percent)
}

/// Unweighted mean of subtask progress; zero with no subtasks.
pub fn overall_progress(subtasks: &[Subtask]) -> i64 {
    if subtasks.is_empty() {
        return 0;
    }
    let total: i64 = subtasks.iter().map(|s| s.progress.percent).sum();
    (total as f64 / subtasks.len() as f64).round() as i64
}

fn eta_suffix(task: &Task) -> String {
    match &task.timeline.eta {
        Some(eta) => format!(" | ETA: {eta}"),
        None => String::new(),
    }
}

pub fn format_task_created(task: &Task) -> String {
    let mut lines = vec![
        "🆕 **New Task Created**".to_string(),
        RULE.to_string(),
        String::new(),
        format!("**{}** | `{}`", task.id, task.title),
        format!(
            "Priority: **{}** | Status: {} {}",
            task.priority,
            task_status_marker(task.status),
            task.status
        ),
    ];
    if let Some(plan) = &task.plan.summary {
        let excerpt: String = plan.chars().take(200).collect();
        lines.push(format!("Plan: {excerpt}"));
    }
    lines.join("\n")
}

pub fn format_status_update(task: &Task, subtasks: &[Subtask]) -> String {
    let bar = progress_bar(overall_progress(subtasks));
    let mut lines = vec![
        format!(
            "**{}** | `{}` | {} {}",
            task.id,
            task.title,
            task_status_marker(task.status),
            task.status
        ),
        format!("{bar}{}", eta_suffix(task)),
    ];

    let shown = subtasks.len().min(MAX_SUBTASKS_SHOWN);
    for (i, st) in subtasks.iter().take(shown).enumerate() {
        let is_last = i + 1 == shown && subtasks.len() <= MAX_SUBTASKS_SHOWN;
        let prefix = if is_last { "└" } else { "├" };
        let detail = match st.status {
            SubtaskStatus::InProgress => format!("{} {}%", st.status, st.progress.percent),
            other => other.to_string(),
        };
        lines.push(format!(
            "{prefix} {} {} ({}) — {detail}",
            subtask_status_marker(st.status),
            st.id,
            st.kind
        ));
    }
    if subtasks.len() > MAX_SUBTASKS_SHOWN {
        lines.push(format!("└ ... and {} more", subtasks.len() - MAX_SUBTASKS_SHOWN));
    }
    lines.join("\n")
}

pub fn format_transition(
    task_id: &str,
    event: &str,
    from: TaskStatus,
    to: TaskStatus,
    actor: &str,
) -> String {
    [
        format!("🔀 **State Transition** — `{task_id}`"),
        RULE.to_string(),
        String::new(),
        format!(
            "{} {} → {} {}",
            task_status_marker(from),
            from,
            task_status_marker(to),
            to
        ),
        format!("Event: `{event}` | Actor: {actor}"),
    ]
    .join("\n")
}

pub fn format_alert(alert: &Alert) -> String {
    let marker = match alert.alert_type {
        AlertType::Stuck => "🔴",
        AlertType::Overdue => "🟡",
        AlertType::Failed => "⚫",
        AlertType::Slow => "🟠",
        _ => "⚠️",
    };
    let mut target = format!("`{}`", alert.task_id);
    if let Some(subtask_id) = &alert.subtask_id {
        target.push(' ');
        target.push_str(subtask_id);
    }

    let mut lines = vec![format!("{marker} **{} ALERT** — {target}", alert.alert_type)];
    if !alert.message.is_empty() {
        lines.push(alert.message.clone());
    }
    if let Some(progress) = alert.progress {
        lines.push(format!("Progress: {progress}%"));
    }
    if let Some(agent) = &alert.agent {
        lines.push(format!("Agent: {agent}"));
    }
    lines.join("\n")
}

pub fn format_completion_summary(task: &Task, subtasks: &[Subtask]) -> String {
    let total = subtasks.len();
    let done = subtasks.iter().filter(|s| s.status == SubtaskStatus::Done).count();
    let failed = subtasks.iter().filter(|s| s.status == SubtaskStatus::Failed).count();

    let mut lines = vec![
        format!("🎉 **Task Completed** — `{}`", task.id),
        RULE.to_string(),
        String::new(),
        format!("**{}**", task.title),
        format!("Priority: {} | {done}/{total} subtasks done", task.priority),
    ];
    if failed > 0 {
        lines.push(format!("⚠️ {failed} subtask(s) failed"));
    }

    let created = &task.created[..task.created.len().min(10)];
    if let Some(completed) = &task.timeline.completed_at {
        let completed = &completed[..completed.len().min(10)];
        lines.push(format!("Timeline: {created} → {completed}"));
    }

    if !subtasks.is_empty() {
        lines.push(String::new());
        for st in subtasks {
            let title: String = st.title.chars().take(40).collect();
            lines.push(format!(
                "{} {} — {}",
                subtask_status_marker(st.status),
                st.id,
                title
            ));
        }
    }
    lines.join("\n")
}

/// Render a full sweep as a digest, loading each task's detail from the
/// store. Tasks that disappeared since the sweep are shown as such.
pub fn format_heartbeat_digest(store: &TaskStore, report: &CheckReport) -> Result<String, StoreError> {
    let mut lines = vec![
        "📊 **Task Engine — Heartbeat Digest**".to_string(),
        RULE.to_string(),
    ];

    if report.tasks.is_empty() {
        lines.push(String::new());
        lines.push("No active tasks.".to_string());
        return Ok(lines.join("\n"));
    }

    for check in &report.tasks {
        lines.push(String::new());
        let Some(task) = store.read_task(&check.task_id).ok().flatten() else {
            lines.push(format!("**{}** | {} — (not found)", check.task_id, check.status));
            continue;
        };
        let subtasks = store.read_all_subtasks(&check.task_id)?;
        let title: String = task.title.chars().take(30).collect();
        lines.push(format!(
            "**{}** | `{}` | {} {}",
            task.id,
            title,
            task_status_marker(task.status),
            task.status
        ));
        lines.push(format!(
            "{}{}",
            progress_bar(overall_progress(&subtasks)),
            eta_suffix(&task)
        ));
    }

    if !report.alerts.is_empty() {
        lines.push(String::new());
        lines.push(format!("⚠️ {} alert(s):", report.alerts.len()));
        for alert in &report.alerts {
            lines.push(format!("- {}", alert.message));
        }
    }
    lines.push(String::new());
    lines.push(report.summary.clone());
    Ok(lines.join("\n"))
}
