//! Durable, lock-protected storage for tasks and subtasks.
//!
//! The store is the sole owner of the on-disk layout:
//!
//! ```text
//! tasks/
//!   index.json          summary cache of all active tasks
//!   TASK-001/
//!     task.json
//!     subtask_01.json
//!     log.jsonl         append-only audit trail
//!   archive/
//!     TASK-002/...      terminal tasks moved out of the active index
//!   .locks/
//!     TASK-001.lock
//! ```
//!
//! Every record write is atomic (temp file + rename), so a concurrent
//! reader only ever observes a complete prior or current version. Readers
//! that will write back must hold the task's lock for the whole
//! read-modify-write sequence; point-in-time readers may skip it.

mod index;
mod lock;
mod log;
mod ops;

pub use self::log::{append_log, LogEvent};
pub use index::RebuildReport;
pub use lock::{FileLockManager, LocalLockManager, LockGuard, LockManager};
pub use ops::{AppliedAutoTransition, SubtaskEventOutcome, TaskTransition};

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::model::{
    now_string, HistoryEntry, IndexEntry, Priority, Subtask, SubtaskStatus, SubtaskType, Task,
};

/// Errors surfaced by the task store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("subtask {1} not found in {0}")]
    SubtaskNotFound(String, String),

    #[error("task {id} is in state {status}, not terminal — cannot archive")]
    NotTerminal { id: String, status: String },

    #[error("corrupt index: {0}")]
    CorruptIndex(String),

    #[error("invalid transition: {status} + '{event}'")]
    InvalidTransition { status: String, event: String },

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {path}: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {path}: {source}")]
    Serialize {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parameters for `create_subtask`.
#[derive(Debug, Clone, Default)]
pub struct NewSubtask {
    pub title: String,
    pub description: String,
    pub kind: SubtaskType,
    /// Assign immediately to this agent (status goes straight to ASSIGNED).
    pub agent: Option<String>,
    /// Ids of sibling subtasks that must be DONE first.
    pub deps: Vec<String>,
    /// Dispatch context recorded on immediate assignment.
    pub context: Option<String>,
}

/// File-backed task store rooted at a tasks directory.
pub struct TaskStore {
    root: PathBuf,
    locks: Box<dyn LockManager>,
}

impl TaskStore {
    /// Open (creating if needed) a store using OS file locks — the
    /// multi-process production configuration.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let locks = Box::new(FileLockManager::new(root.join(".locks")));
        Self::with_lock_manager(root, locks)
    }

    /// Open a store with an explicit lock manager (tests use
    /// `LocalLockManager`).
    pub fn with_lock_manager(
        root: impl Into<PathBuf>,
        locks: Box<dyn LockManager>,
    ) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            path: root.display().to_string(),
            source,
        })?;
        Ok(Self { root, locks })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquire the task's exclusive lock. Blocks until available.
    pub fn lock_task(&self, task_id: &str) -> Result<Box<dyn LockGuard>, StoreError> {
        self.locks.lock(task_id)
    }

    pub(crate) fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }

    pub(crate) fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub(crate) fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Directory holding this task's records: the active directory if its
    /// `task.json` exists, otherwise the archive location.
    fn resolve_task_dir(&self, task_id: &str) -> PathBuf {
        let active = self.task_dir(task_id);
        if active.join("task.json").exists() {
            active
        } else {
            let archived = self.archive_dir().join(task_id);
            if archived.join("task.json").exists() {
                archived
            } else {
                active
            }
        }
    }

    /// Append to the task's `log.jsonl`, following it into the archive.
    pub fn append_task_log(&self, task_id: &str, event: &LogEvent) -> Result<(), StoreError> {
        append_log(&self.resolve_task_dir(task_id), event)
    }

    // --- Task CRUD ---

    /// Create a new task: allocate the next id, make the directory, write
    /// the record, append the creation log event, and add an index row.
    pub fn create_task(
        &self,
        title: &str,
        priority: Priority,
        plan_text: Option<&str>,
        description: &str,
    ) -> Result<Task, StoreError> {
        let task_id = self.next_task_id()?;
        let task_dir = self.task_dir(&task_id);
        std::fs::create_dir_all(&task_dir).map_err(|source| StoreError::Io {
            path: task_dir.display().to_string(),
            source,
        })?;

        let mut task = Task::new(&task_id, title, priority, description);
        if let Some(plan) = plan_text {
            task.plan.summary = Some(plan.to_string());
        }
        task.add_history(
            HistoryEntry::new("created", "operator")
                .with_to_status("PLANNING")
                .with_note("Task created"),
        );

        write_json_atomic(&task_dir.join("task.json"), &task)?;
        append_log(&task_dir, &LogEvent::new("task.created", &task_id).actor("operator"))?;
        self.add_to_index(&task)?;

        info!("created task {}: {}", task_id, title);
        Ok(task)
    }

    /// Read a task record, falling back to the archive so historical tasks
    /// remain queryable. `Ok(None)` means the id resolves nowhere.
    pub fn read_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let active = self.task_dir(task_id).join("task.json");
        if active.exists() {
            return read_json(&active).map(Some);
        }
        let archived = self.archive_dir().join(task_id).join("task.json");
        if archived.exists() {
            return read_json(&archived).map(Some);
        }
        Ok(None)
    }

    /// Read a task that must exist.
    pub fn require_task(&self, task_id: &str) -> Result<Task, StoreError> {
        self.read_task(task_id)?
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))
    }

    /// Persist a task record atomically, refreshing `updated`.
    pub fn save_task(&self, task: &mut Task) -> Result<(), StoreError> {
        task.updated = now_string();
        let task_dir = self.task_dir(&task.id);
        std::fs::create_dir_all(&task_dir).map_err(|source| StoreError::Io {
            path: task_dir.display().to_string(),
            source,
        })?;
        write_json_atomic(&task_dir.join("task.json"), task)
    }

    /// Move a terminal task into the archive area and drop its index row.
    /// Ids are never recycled; the archived directory keeps the id.
    pub fn archive_task(&self, task_id: &str) -> Result<(), StoreError> {
        let task = self.require_task(task_id)?;
        if !task.status.is_terminal() {
            return Err(StoreError::NotTerminal {
                id: task_id.to_string(),
                status: task.status.to_string(),
            });
        }

        let src = self.task_dir(task_id);
        if !src.exists() {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        let archive = self.archive_dir();
        std::fs::create_dir_all(&archive).map_err(|source| StoreError::Io {
            path: archive.display().to_string(),
            source,
        })?;
        let dst = archive.join(task_id);
        std::fs::rename(&src, &dst).map_err(|source| StoreError::Io {
            path: dst.display().to_string(),
            source,
        })?;

        self.remove_from_index(task_id)?;
        append_log(&dst, &LogEvent::new("task.archived", task_id))?;

        info!("archived task {}", task_id);
        Ok(())
    }

    // --- Subtask CRUD ---

    /// Create a subtask under `task_id`. Allocates the next `subtask_NN` id
    /// scoped to the parent, snapshots the parent's priority, marks the
    /// subtask BLOCKED if any dependency is not yet DONE, and assigns it
    /// immediately when an agent is supplied.
    pub fn create_subtask(&self, task_id: &str, spec: NewSubtask) -> Result<Subtask, StoreError> {
        let mut task = self.require_task(task_id)?;

        let next_num = task
            .subtasks
            .iter()
            .filter_map(|sid| sid.rsplit('_').next()?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        let subtask_id = format!("subtask_{next_num:02}");

        let mut subtask = Subtask::new(
            &subtask_id,
            task_id,
            &spec.title,
            &spec.description,
            spec.kind,
            task.priority,
        );

        if !spec.deps.is_empty() {
            subtask.dependencies = spec.deps.clone();
            subtask.blocked_by = spec.deps.clone();
        }

        if let Some(agent) = &spec.agent {
            subtask.status = SubtaskStatus::Assigned;
            subtask.assignment.agent = Some(agent.clone());
            subtask.assignment.assigned_at = Some(now_string());
            subtask.assignment.dispatch_context = spec.context.clone();
            subtask.add_history(
                HistoryEntry::new("assigned", "operator").with_note(format!("Dispatched to {agent}")),
            );
        } else {
            subtask.add_history(HistoryEntry::new("created", "operator").with_note("Subtask created"));
        }

        // Dependencies gate assignment: any non-DONE dependency blocks the
        // new subtask regardless of the agent field.
        for dep_id in &spec.deps {
            if let Some(dep) = self.read_subtask(task_id, dep_id)? {
                if dep.status != SubtaskStatus::Done {
                    subtask.status = SubtaskStatus::Blocked;
                    subtask.add_history(
                        HistoryEntry::new("block", "system").with_note(format!("Blocked by {dep_id}")),
                    );
                    break;
                }
            }
        }

        let task_dir = self.task_dir(task_id);
        write_json_atomic(&task_dir.join(format!("{subtask_id}.json")), &subtask)?;

        task.subtasks.push(subtask_id.clone());
        self.save_task(&mut task)?;
        let count = task.subtasks.len();
        self.update_index_entry(task_id, |entry| entry.subtask_count = count)?;

        append_log(
            &task_dir,
            &LogEvent::new("subtask.dispatched", task_id)
                .subtask(&subtask_id)
                .agent(spec.agent.as_deref().unwrap_or("unassigned")),
        )?;

        info!("created subtask {}/{}: {}", task_id, subtask_id, spec.title);
        Ok(subtask)
    }

    /// Read a subtask record, following archived parents like `read_task`.
    pub fn read_subtask(
        &self,
        task_id: &str,
        subtask_id: &str,
    ) -> Result<Option<Subtask>, StoreError> {
        let path = self
            .resolve_task_dir(task_id)
            .join(format!("{subtask_id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// Read a subtask that must exist.
    pub fn require_subtask(&self, task_id: &str, subtask_id: &str) -> Result<Subtask, StoreError> {
        self.read_subtask(task_id, subtask_id)?.ok_or_else(|| {
            StoreError::SubtaskNotFound(task_id.to_string(), subtask_id.to_string())
        })
    }

    /// Persist a subtask record atomically.
    pub fn save_subtask(&self, subtask: &Subtask) -> Result<(), StoreError> {
        let dir = self.resolve_task_dir(&subtask.parent_task);
        write_json_atomic(&dir.join(format!("{}.json", subtask.id)), subtask)
    }

    /// Resolve the parent's subtask-id list to full records, in list order.
    /// Ids without a record on disk are skipped.
    pub fn read_all_subtasks(&self, task_id: &str) -> Result<Vec<Subtask>, StoreError> {
        let Some(task) = self.read_task(task_id)? else {
            return Ok(Vec::new());
        };
        let mut subtasks = Vec::with_capacity(task.subtasks.len());
        for sid in &task.subtasks {
            if let Some(st) = self.read_subtask(task_id, sid)? {
                subtasks.push(st);
            }
        }
        Ok(subtasks)
    }

    pub fn count_done_subtasks(&self, task_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .read_all_subtasks(task_id)?
            .iter()
            .filter(|s| s.status == SubtaskStatus::Done)
            .count())
    }

    /// List index rows, optionally including terminal tasks.
    pub fn list_tasks(&self, include_terminal: bool) -> Result<Vec<IndexEntry>, StoreError> {
        let index = self.read_index()?;
        Ok(index
            .tasks
            .into_iter()
            .filter(|e| include_terminal || !e.status.is_terminal())
            .collect())
    }
}

/// Write JSON atomically: serialize to a temp file, then rename into place.
/// A failed write leaves the previous version intact.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let data =
        serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialize {
            path: path.display().to_string(),
            source,
        })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, data).map_err(|source| StoreError::Io {
        path: tmp.display().to_string(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

/// Read and deserialize a JSON record. Malformed content is a hard error;
/// the checker converts it into batch-safe data at its own boundary.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = std::fs::read(path).map_err(|source| StoreError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Malformed {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
pub(crate) fn test_store(root: &Path) -> TaskStore {
    TaskStore::with_lock_manager(root, Box::new(LocalLockManager::new())).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;

    #[test]
    fn create_task_writes_record_log_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("Add login", Priority::P1, Some("plan"), "").unwrap();

        assert_eq!(task.id, "TASK-001");
        assert_eq!(task.status, TaskStatus::Planning);
        assert!(dir.path().join("TASK-001/task.json").exists());
        assert!(dir.path().join("TASK-001/log.jsonl").exists());

        let index = store.read_index().unwrap();
        assert_eq!(index.tasks.len(), 1);
        assert_eq!(index.tasks[0].id, "TASK-001");

        let read = store.require_task("TASK-001").unwrap();
        assert_eq!(read.plan.summary.as_deref(), Some("plan"));
        assert_eq!(read.history.len(), 1);
    }

    #[test]
    fn save_and_read_round_trip_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let mut task = store.create_task("Round trip", Priority::P0, None, "desc").unwrap();
        task.timeline.eta = Some("2026-12-31".into());
        store.save_task(&mut task).unwrap();

        let read = store.require_task(&task.id).unwrap();
        let a = serde_json::to_value(&task).unwrap();
        let b = serde_json::to_value(&read).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn task_ids_are_monotonic_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        for _ in 0..5 {
            store.create_task("t", Priority::P1, None, "").unwrap();
        }
        // Terminal-ize and archive TASK-003.
        let mut task = store.require_task("TASK-003").unwrap();
        task.status = TaskStatus::Completed;
        store.save_task(&mut task).unwrap();
        store.update_index_entry("TASK-003", |e| e.status = TaskStatus::Completed).unwrap();
        store.archive_task("TASK-003").unwrap();

        let next = store.create_task("after archive", Priority::P1, None, "").unwrap();
        assert_eq!(next.id, "TASK-006");
    }

    #[test]
    fn read_task_falls_back_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let mut task = store.create_task("done soon", Priority::P2, None, "").unwrap();
        task.status = TaskStatus::Completed;
        store.save_task(&mut task).unwrap();
        store.archive_task(&task.id).unwrap();

        assert!(!dir.path().join("TASK-001").exists());
        let read = store.read_task("TASK-001").unwrap().unwrap();
        assert_eq!(read.status, TaskStatus::Completed);
        // Removed from the active index.
        assert!(store.read_index().unwrap().entry("TASK-001").is_none());
    }

    #[test]
    fn archive_refuses_non_terminal_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("still planning", Priority::P1, None, "").unwrap();
        let err = store.archive_task(&task.id).unwrap_err();
        assert!(matches!(err, StoreError::NotTerminal { .. }));
        assert!(dir.path().join("TASK-001/task.json").exists());
    }

    #[test]
    fn create_subtask_allocates_scoped_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("parent", Priority::P1, None, "").unwrap();

        let st1 = store
            .create_subtask(&task.id, NewSubtask {
                title: "implement".into(),
                kind: SubtaskType::Dev,
                ..Default::default()
            })
            .unwrap();
        let st2 = store
            .create_subtask(&task.id, NewSubtask {
                title: "test".into(),
                kind: SubtaskType::Test,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(st1.id, "subtask_01");
        assert_eq!(st2.id, "subtask_02");
        assert_eq!(st1.priority, Priority::P1);
        assert_eq!(st1.status, SubtaskStatus::Pending);

        let parent = store.require_task(&task.id).unwrap();
        assert_eq!(parent.subtasks, vec!["subtask_01", "subtask_02"]);
        let entry = store.read_index().unwrap().entry(&task.id).cloned().unwrap();
        assert_eq!(entry.subtask_count, 2);
    }

    #[test]
    fn subtask_with_unmet_dependency_is_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("parent", Priority::P1, None, "").unwrap();
        store
            .create_subtask(&task.id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                ..Default::default()
            })
            .unwrap();
        let st2 = store
            .create_subtask(&task.id, NewSubtask {
                title: "verify".into(),
                kind: SubtaskType::Test,
                deps: vec!["subtask_01".into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(st2.status, SubtaskStatus::Blocked);
        assert_eq!(st2.blocked_by, vec!["subtask_01"]);
    }

    #[test]
    fn subtask_with_agent_is_assigned_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("parent", Priority::P1, None, "").unwrap();
        let st = store
            .create_subtask(&task.id, NewSubtask {
                title: "impl".into(),
                kind: SubtaskType::Dev,
                agent: Some("claude-code".into()),
                context: Some("go".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(st.status, SubtaskStatus::Assigned);
        assert_eq!(st.assignment.agent.as_deref(), Some("claude-code"));
        assert!(st.assignment.assigned_at.is_some());
    }

    #[test]
    fn create_subtask_on_missing_parent_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let err = store
            .create_subtask("TASK-404", NewSubtask::default())
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(_)));
    }

    #[test]
    fn read_all_subtasks_preserves_list_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("parent", Priority::P1, None, "").unwrap();
        for title in ["a", "b", "c"] {
            store
                .create_subtask(&task.id, NewSubtask {
                    title: title.into(),
                    ..Default::default()
                })
                .unwrap();
        }
        let subtasks = store.read_all_subtasks(&task.id).unwrap();
        let titles: Vec<&str> = subtasks.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b", "c"]);
    }

    #[test]
    fn malformed_record_surfaces_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.create_task("corrupt me", Priority::P1, None, "").unwrap();
        std::fs::write(dir.path().join("TASK-001/task.json"), "{not json").unwrap();
        let err = store.read_task("TASK-001").unwrap_err();
        assert!(matches!(err, StoreError::Malformed { .. }));
    }
}
