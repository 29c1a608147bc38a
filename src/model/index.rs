//! Denormalized summary rows cached in `index.json`.
//!
//! The index exists so listings do not have to open every task directory.
//! It is a cache, never the source of truth: on any disagreement the
//! `task.json` record wins, and `rebuild_index` can reconstruct it.

use serde::{Deserialize, Serialize};

use super::status::{Priority, TaskStatus};
use super::task::Task;

/// One summary row per active task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub created: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discord_channel_id: Option<String>,
    #[serde(default)]
    pub subtask_count: usize,
    #[serde(default)]
    pub subtasks_done: usize,
}

impl IndexEntry {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            priority: task.priority,
            created: task.created.clone(),
            discord_channel_id: task.discord.channel_id.clone(),
            subtask_count: task.subtasks.len(),
            subtasks_done: 0,
        }
    }
}

fn index_version() -> u32 {
    1
}

/// The whole `index.json` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIndex {
    #[serde(default = "index_version")]
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<IndexEntry>,
}

impl Default for TaskIndex {
    fn default() -> Self {
        Self {
            version: index_version(),
            tasks: Vec::new(),
        }
    }
}

impl TaskIndex {
    pub fn entry(&self, task_id: &str) -> Option<&IndexEntry> {
        self.tasks.iter().find(|e| e.id == task_id)
    }

    pub fn entry_mut(&mut self, task_id: &str) -> Option<&mut IndexEntry> {
        self.tasks.iter_mut().find(|e| e.id == task_id)
    }

    /// Entries for tasks that are not in a terminal status.
    pub fn active(&self) -> impl Iterator<Item = &IndexEntry> {
        self.tasks.iter().filter(|e| !e.status.is_terminal())
    }
}
