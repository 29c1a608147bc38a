//! task-engine — CLI entry point.
//!
//! Every invocation is a fresh short-lived process; all shared state
//! lives in the tasks directory and is coordinated through the store's
//! per-task locks.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use task_engine::checker::{self, AlertType, CheckReport};
use task_engine::config::{self, EngineConfig};
use task_engine::dispatch::{AgentRegistry, Dispatcher};
use task_engine::model::{Priority, SubtaskType};
use task_engine::notify;
use task_engine::state::{
    valid_subtask_events, valid_task_events, SubtaskEvent, TaskEvent,
};
use task_engine::store::{NewSubtask, StoreError, TaskStore};

#[derive(Parser)]
#[command(name = "task-engine", version, about = "Multi-agent task orchestration engine")]
struct Cli {
    /// Tasks directory (overrides TASK_ENGINE_TASKS_DIR).
    #[arg(long, global = true)]
    tasks_dir: Option<PathBuf>,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new task.
    Create {
        /// Task title.
        title: String,
        /// Task priority.
        #[arg(long, default_value = "P1")]
        priority: Priority,
        /// Initial plan text.
        #[arg(long)]
        plan: Option<String>,
        /// Longer description.
        #[arg(long, default_value = "")]
        description: String,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
    },

    /// View task status (one task in detail, or a summary of all).
    Status {
        /// Task ID for the detail view.
        task_id: Option<String>,
        /// Include terminal tasks in the summary.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },

    /// Create and assign a subtask.
    Dispatch {
        /// Parent task ID.
        task_id: String,
        /// Subtask title.
        title: String,
        /// Agent to assign (e.g. claude-code).
        #[arg(long)]
        agent: Option<String>,
        /// Subtask type.
        #[arg(long = "type", default_value = "dev")]
        kind: SubtaskType,
        /// Comma-separated dependency subtask IDs.
        #[arg(long)]
        deps: Option<String>,
        /// Dispatch context for the agent.
        #[arg(long)]
        context: Option<String>,
        /// Subtask description.
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        json: bool,
    },

    /// Advance task state with a named event.
    Transition {
        task_id: String,
        /// Transition event (e.g. approve, start, complete).
        event: String,
        /// Note recorded with the transition.
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        json: bool,
    },

    /// Update subtask state/progress.
    Subtask {
        task_id: String,
        subtask_id: String,
        /// Subtask event (start, done, fail, block, unblock).
        event: String,
        #[arg(long)]
        note: Option<String>,
        /// Progress percent (0-100).
        #[arg(long)]
        progress: Option<i64>,
        #[arg(long)]
        json: bool,
    },

    /// Heartbeat-triggered state check.
    Check {
        /// Check a specific task (default: all active tasks).
        task_id: Option<String>,
        /// Minimal output for cron.
        #[arg(long)]
        quiet: bool,
        #[arg(long)]
        json: bool,
        /// Print a chat digest instead of plain output.
        #[arg(long)]
        digest: bool,
    },

    /// Generate chat-formatted notifications.
    Notify {
        /// Notification type.
        #[arg(value_parser = ["created", "status", "transition", "completion", "alert", "digest"])]
        kind: String,
        /// Task ID (not needed for digest).
        task_id: Option<String>,
        /// Transition event name (for the transition type).
        #[arg(long)]
        event: Option<String>,
        /// Alert type: stuck/overdue/failed (for the alert type).
        #[arg(long = "type")]
        alert_type: Option<String>,
        /// Subtask ID (for the alert type).
        #[arg(long)]
        subtask_id: Option<String>,
    },

    /// Archive a terminal-state task.
    Archive {
        task_id: String,
        #[arg(long)]
        json: bool,
    },

    /// Auto-dispatch ready subtasks.
    AutoDispatch {
        /// Task ID (optional with --all).
        task_id: Option<String>,
        /// Process every active task.
        #[arg(long)]
        all: bool,
        /// Report what would dispatch without committing.
        #[arg(long)]
        dry_run: bool,
        /// Target one subtask.
        #[arg(long)]
        subtask: Option<String>,
        /// Print the full dispatch context for the targeted subtask.
        #[arg(long)]
        show_context: bool,
    },

    /// Rebuild index.json from the task directories.
    RebuildIndex {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "task_engine=debug"
    } else {
        "task_engine=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let root = cli.tasks_dir.clone().unwrap_or_else(config::tasks_dir);
    let store = TaskStore::open(&root)
        .with_context(|| format!("cannot open task store at {}", root.display()))?;

    match cli.command {
        Commands::Create {
            title,
            priority,
            plan,
            description,
            json,
        } => cmd_create(&store, &title, priority, plan.as_deref(), &description, json),
        Commands::Status { task_id, all, json } => cmd_status(&store, task_id.as_deref(), all, json),
        Commands::Dispatch {
            task_id,
            title,
            agent,
            kind,
            deps,
            context,
            description,
            json,
        } => {
            let deps = deps
                .map(|d| d.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            cmd_dispatch(
                &store,
                &task_id,
                NewSubtask {
                    title,
                    description,
                    kind,
                    agent,
                    deps,
                    context,
                },
                json,
            )
        }
        Commands::Transition {
            task_id,
            event,
            note,
            json,
        } => cmd_transition(&store, &task_id, &event, note.as_deref(), json),
        Commands::Subtask {
            task_id,
            subtask_id,
            event,
            note,
            progress,
            json,
        } => cmd_subtask(&store, &task_id, &subtask_id, &event, note.as_deref(), progress, json),
        Commands::Check {
            task_id,
            quiet,
            json,
            digest,
        } => cmd_check(&store, task_id.as_deref(), quiet, json, digest),
        Commands::Notify {
            kind,
            task_id,
            event,
            alert_type,
            subtask_id,
        } => cmd_notify(
            &store,
            &kind,
            task_id.as_deref(),
            event.as_deref(),
            alert_type.as_deref(),
            subtask_id.as_deref(),
        ),
        Commands::Archive { task_id, json } => cmd_archive(&store, &task_id, json),
        Commands::AutoDispatch {
            task_id,
            all,
            dry_run,
            subtask,
            show_context,
        } => cmd_auto_dispatch(&store, task_id.as_deref(), all, dry_run, subtask.as_deref(), show_context),
        Commands::RebuildIndex { json } => cmd_rebuild_index(&store, json),
    }
}

fn load_config(store: &TaskStore) -> EngineConfig {
    EngineConfig::load_from(store.root())
}

fn cmd_create(
    store: &TaskStore,
    title: &str,
    priority: Priority,
    plan: Option<&str>,
    description: &str,
    json: bool,
) -> anyhow::Result<()> {
    let task = store.create_task(title, priority, plan, description)?;
    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "task_id": task.id,
                "status": task.status,
                "message": format!("Created {}", task.id),
            })
        );
        return Ok(());
    }
    println!(
        "Created {}: {} [{}] — {}",
        task.id, task.title, task.priority, task.status
    );
    Ok(())
}

fn cmd_status(store: &TaskStore, task_id: Option<&str>, all: bool, json: bool) -> anyhow::Result<()> {
    let Some(task_id) = task_id else {
        let tasks = store.list_tasks(all)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
            return Ok(());
        }
        if tasks.is_empty() {
            println!("No active tasks.");
            return Ok(());
        }
        println!("{:<12} {:<14} {:<4} {:<10} Title", "ID", "Status", "Pri", "Subtasks");
        for t in tasks {
            let sub = if t.subtask_count > 0 {
                format!("{}/{}", t.subtasks_done, t.subtask_count)
            } else {
                "-".to_string()
            };
            let title: String = t.title.chars().take(40).collect();
            println!("{:<12} {:<14} {:<4} {:<10} {}", t.id, t.status.to_string(), t.priority.to_string(), sub, title);
        }
        return Ok(());
    };

    let task = store.require_task(task_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    let subtasks = store.read_all_subtasks(task_id)?;
    let done = subtasks
        .iter()
        .filter(|s| s.status == task_engine::model::SubtaskStatus::Done)
        .count();

    let rule = "=".repeat(60);
    println!("{rule}");
    println!("  {}: {}", task.id, task.title);
    println!("  Status: {}  |  Priority: {}", task.status, task.priority);
    println!("  Created: {}", task.created);
    println!("  Updated: {}", task.updated);
    if let Some(summary) = &task.plan.summary {
        println!("  Plan: {summary}");
    }
    if let Some(eta) = &task.timeline.eta {
        println!("  ETA: {eta}");
    }
    if let Some(reason) = &task.metadata.blocked_reason {
        println!("  Blocked: {reason}");
    }
    if !subtasks.is_empty() {
        println!("\n  Subtasks ({done}/{} done):", subtasks.len());
        for st in &subtasks {
            let agent = st.assignment.agent.as_deref().unwrap_or("unassigned");
            let marker = match st.status {
                task_engine::model::SubtaskStatus::Done => "+",
                task_engine::model::SubtaskStatus::InProgress => ">",
                _ => "-",
            };
            let title: String = st.title.chars().take(40).collect();
            println!("    [{marker}] {} {}", st.id, title);
            println!("        {} | {agent} | {}%", st.status, st.progress.percent);
            if !st.blocked_by.is_empty() {
                println!("        blocked_by: {}", st.blocked_by.join(", "));
            }
        }
    }
    if !task.history.is_empty() {
        println!("\n  Recent history:");
        for h in task.history.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
            let ts = &h.time[..h.time.len().min(19)];
            match &h.note {
                Some(note) => println!("    {ts} {} — {note}", h.event),
                None => println!("    {ts} {}", h.event),
            }
        }
    }
    println!("{rule}");
    let valid = valid_task_events(task.status);
    if !valid.is_empty() {
        let names: Vec<&str> = valid.iter().map(|e| e.as_str()).collect();
        println!("  Valid transitions: {}", names.join(", "));
    }
    Ok(())
}

fn cmd_dispatch(store: &TaskStore, task_id: &str, spec: NewSubtask, json: bool) -> anyhow::Result<()> {
    let agent = spec.agent.clone();
    let kind = spec.kind;
    let deps = spec.deps.clone();
    let (subtask, _started) = store.dispatch_subtask(task_id, spec)?;

    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "task_id": task_id,
                "subtask_id": subtask.id,
                "status": subtask.status,
                "message": format!("Dispatched {}", subtask.id),
            })
        );
        return Ok(());
    }
    println!("Dispatched {} in {}: {}", subtask.id, task_id, subtask.title);
    println!(
        "  Agent: {}  |  Type: {}  |  Status: {}",
        agent.as_deref().unwrap_or("unassigned"),
        kind,
        subtask.status
    );
    if !deps.is_empty() {
        println!("  Dependencies: {}", deps.join(", "));
    }
    Ok(())
}

fn cmd_transition(
    store: &TaskStore,
    task_id: &str,
    event: &str,
    note: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let event: TaskEvent = event.parse().map_err(|e: String| anyhow!(e))?;
    match store.transition_task(task_id, event, "user", note) {
        Ok(transition) => {
            if json {
                println!(
                    "{}",
                    json!({
                        "ok": true,
                        "task_id": task_id,
                        "status": transition.to,
                        "message": format!("{} -> {}", transition.from, transition.to),
                    })
                );
            } else {
                println!("{task_id}: {} -> {} (event: {event})", transition.from, transition.to);
            }
            Ok(())
        }
        Err(StoreError::InvalidTransition { status, event }) => {
            let valid: Vec<&str> = store
                .read_task(task_id)?
                .map(|t| valid_task_events(t.status))
                .unwrap_or_default()
                .iter()
                .map(|e| e.as_str())
                .collect();
            let hint = if valid.is_empty() {
                "none (terminal)".to_string()
            } else {
                valid.join(", ")
            };
            bail!("invalid transition: {status} + '{event}' (valid events: {hint})")
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_subtask(
    store: &TaskStore,
    task_id: &str,
    subtask_id: &str,
    event: &str,
    note: Option<&str>,
    progress: Option<i64>,
    json: bool,
) -> anyhow::Result<()> {
    let event: SubtaskEvent = event.parse().map_err(|e: String| anyhow!(e))?;
    match store.apply_subtask_event(task_id, subtask_id, event, note, progress) {
        Ok(outcome) => {
            if json {
                println!(
                    "{}",
                    json!({
                        "ok": true,
                        "task_id": task_id,
                        "subtask_id": subtask_id,
                        "status": outcome.to,
                        "message": format!("{} -> {}", outcome.from, outcome.to),
                    })
                );
                return Ok(());
            }
            if let Some(auto) = &outcome.auto_transition {
                println!(
                    "  Auto-transition: {task_id} {} -> {} ({})",
                    auto.from, auto.to, auto.reason
                );
            }
            println!(
                "{task_id}/{subtask_id}: {} -> {} (event: {event})",
                outcome.from, outcome.to
            );
            Ok(())
        }
        Err(StoreError::InvalidTransition { status, event }) => {
            let valid: Vec<&str> = store
                .read_subtask(task_id, subtask_id)?
                .map(|s| valid_subtask_events(s.status))
                .unwrap_or_default()
                .iter()
                .map(|e| e.as_str())
                .collect();
            let hint = if valid.is_empty() {
                "none (terminal)".to_string()
            } else {
                valid.join(", ")
            };
            bail!("invalid subtask transition: {status} + '{event}' (valid events: {hint})")
        }
        Err(err) => Err(err.into()),
    }
}

fn cmd_check(
    store: &TaskStore,
    task_id: Option<&str>,
    quiet: bool,
    json: bool,
    digest: bool,
) -> anyhow::Result<()> {
    let config = load_config(store);
    let report: CheckReport = match task_id {
        Some(task_id) => {
            let check = checker::check_single_task(store, task_id, &config)?;
            let alerts = check.alerts.clone();
            let all_ok = alerts.is_empty();
            let stuck_count = alerts
                .iter()
                .filter(|a| a.alert_type == AlertType::Stuck)
                .count();
            CheckReport {
                summary: format!("{}/{} done", check.subtasks_done, check.subtask_total),
                all_ok,
                active_count: 1,
                stuck_count,
                alerts,
                tasks: vec![check],
            }
        }
        None => checker::check_all_tasks(store, &config)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    if digest {
        println!("{}", notify::format_heartbeat_digest(store, &report)?);
        return Ok(());
    }
    if quiet {
        if report.all_ok {
            println!("OK: {}", report.summary);
        } else {
            for alert in &report.alerts {
                println!("ALERT: {}", alert.message);
            }
        }
        return Ok(());
    }

    if report.tasks.is_empty() {
        println!("No active tasks.");
        return Ok(());
    }
    let rule = "=".repeat(60);
    println!(
        "Task Engine Check — {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M")
    );
    println!("{rule}");
    for check in &report.tasks {
        let marker = if check.alerts.is_empty() { "." } else { "!" };
        println!(
            "  [{marker}] {}: {} ({}/{} done)",
            check.task_id, check.status, check.subtasks_done, check.subtask_total
        );
    }
    if report.alerts.is_empty() {
        println!("\nAll clear.");
    } else {
        println!("\nAlerts ({}):", report.alerts.len());
        for alert in &report.alerts {
            println!("  ! {}", alert.message);
        }
    }
    println!("{rule}");
    println!("Summary: {}", report.summary);
    Ok(())
}

fn cmd_notify(
    store: &TaskStore,
    kind: &str,
    task_id: Option<&str>,
    event: Option<&str>,
    alert_type: Option<&str>,
    subtask_id: Option<&str>,
) -> anyhow::Result<()> {
    if kind == "digest" {
        let config = load_config(store);
        let report = checker::check_all_tasks(store, &config)?;
        println!("{}", notify::format_heartbeat_digest(store, &report)?);
        return Ok(());
    }

    let task_id = task_id.context("task ID required for this notification type")?;
    let task = store.require_task(task_id)?;

    match kind {
        "created" => println!("{}", notify::format_task_created(&task)),
        "status" => {
            let subtasks = store.read_all_subtasks(task_id)?;
            println!("{}", notify::format_status_update(&task, &subtasks));
        }
        "completion" => {
            let subtasks = store.read_all_subtasks(task_id)?;
            println!("{}", notify::format_completion_summary(&task, &subtasks));
        }
        "transition" => {
            // Render the most recent transition from history.
            let last = task
                .history
                .iter()
                .rev()
                .find(|h| h.event == "transition")
                .context("no transition found in history")?;
            let parse = |s: Option<&String>| -> Option<task_engine::model::TaskStatus> {
                s.and_then(|v| serde_json::from_value(json!(v)).ok())
            };
            let from = parse(last.from_status.as_ref()).unwrap_or(task.status);
            let to = parse(last.to_status.as_ref()).unwrap_or(task.status);
            println!(
                "{}",
                notify::format_transition(
                    task_id,
                    event.unwrap_or("transition"),
                    from,
                    to,
                    &last.actor,
                )
            );
        }
        "alert" => {
            let alert_type = match alert_type.unwrap_or("stuck") {
                "overdue" => AlertType::Overdue,
                "failed" => AlertType::Failed,
                "slow" => AlertType::Slow,
                _ => AlertType::Stuck,
            };
            let mut alert = task_engine::checker::Alert {
                alert_type,
                task_id: task_id.to_string(),
                subtask_id: subtask_id.map(str::to_string),
                message: match subtask_id {
                    Some(sid) => format!("Alert triggered for {task_id}/{sid}"),
                    None => format!("Alert triggered for {task_id}"),
                },
                agent: None,
                progress: None,
            };
            if let Some(sid) = subtask_id {
                if let Some(st) = store.read_subtask(task_id, sid)? {
                    alert.agent = st.assignment.agent.clone();
                    alert.progress = Some(st.progress.percent);
                }
            }
            println!("{}", notify::format_alert(&alert));
        }
        other => bail!("unknown notification type: {other}"),
    }
    Ok(())
}

fn cmd_archive(store: &TaskStore, task_id: &str, json: bool) -> anyhow::Result<()> {
    store.archive_task(task_id)?;
    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "task_id": task_id,
                "status": "archived",
                "message": format!("Archived {task_id}"),
            })
        );
        return Ok(());
    }
    println!("Archived {task_id}");
    Ok(())
}

fn cmd_auto_dispatch(
    store: &TaskStore,
    task_id: Option<&str>,
    all: bool,
    dry_run: bool,
    subtask: Option<&str>,
    show_context: bool,
) -> anyhow::Result<()> {
    let task_ids: Vec<String> = if all {
        store.list_tasks(false)?.into_iter().map(|e| e.id).collect()
    } else if let Some(task_id) = task_id {
        vec![task_id.to_string()]
    } else {
        bail!("specify a task ID or --all");
    };

    let dispatcher = Dispatcher::new(store, AgentRegistry::with_defaults());
    let mut dispatches = Vec::new();
    let mut skipped = Vec::new();

    for task_id in &task_ids {
        let Some(task) = store.read_task(task_id)? else {
            skipped.push(json!({
                "task_id": task_id,
                "subtask_id": null,
                "reason": "Task not found",
            }));
            continue;
        };
        let all_subtasks = store.read_all_subtasks(task_id)?;

        let targets: Vec<_> = match subtask {
            Some(sid) => {
                let Some(st) = all_subtasks.iter().find(|s| s.id == sid) else {
                    bail!("subtask {sid} not found in {task_id}");
                };
                vec![st.clone()]
            }
            None => all_subtasks.clone(),
        };

        for st in &targets {
            if show_context {
                let context = dispatcher.context_for(&task, st, &all_subtasks);
                println!("{}", serde_json::to_string_pretty(&context)?);
                return Ok(());
            }

            let readiness = dispatcher.check_readiness(&task, st, &all_subtasks)?;
            if !readiness.ready {
                skipped.push(json!({
                    "task_id": task_id,
                    "subtask_id": st.id,
                    "reason": readiness.reason,
                }));
                continue;
            }

            let context = dispatcher.context_for(&task, st, &all_subtasks);
            let prompt = context.prompt();
            let agent = readiness.agent.clone().unwrap_or_else(|| context.agent.clone());

            if !dry_run {
                store.commit_auto_dispatch(task_id, &st.id, &agent, &prompt)?;
            }
            dispatches.push(json!({
                "task_id": task_id,
                "subtask_id": st.id,
                "agent": agent,
                "prompt": prompt,
                "ready": true,
                "reason": readiness.reason,
            }));
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "dispatches": dispatches,
            "skipped": skipped,
        }))?
    );
    Ok(())
}

fn cmd_rebuild_index(store: &TaskStore, json: bool) -> anyhow::Result<()> {
    let report = store.rebuild_index()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("Rebuilt index with {} task(s)", report.rebuilt.len());
    for id in &report.rebuilt {
        println!("  + {id}");
    }
    for name in &report.skipped {
        println!("  skipped {name}");
    }
    Ok(())
}
