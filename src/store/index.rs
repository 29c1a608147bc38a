//! `index.json` maintenance.
//!
//! The index is a cache of summary rows for active tasks. Every mutation
//! elsewhere that changes status or subtask counts updates it in the same
//! logical operation; `rebuild_index` reconstructs it from the task
//! directories when it drifts or is lost.

use serde::Serialize;
use tracing::warn;

use crate::model::{IndexEntry, SubtaskStatus, Task, TaskIndex};

use super::{read_json, write_json_atomic, StoreError, TaskStore};

/// Outcome of `rebuild_index`.
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    /// Task ids written into the fresh index, in directory order.
    pub rebuilt: Vec<String>,
    /// Directory names skipped because their records were missing or
    /// unreadable.
    pub skipped: Vec<String>,
}

impl TaskStore {
    /// Read `index.json`, returning an empty versioned index when missing.
    pub fn read_index(&self) -> Result<TaskIndex, StoreError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(TaskIndex::default());
        }
        read_json(&path)
    }

    /// Write `index.json` atomically.
    pub fn write_index(&self, index: &TaskIndex) -> Result<(), StoreError> {
        write_json_atomic(&self.index_path(), index)
    }

    /// Allocate the next unused `TASK-NNN` id, scanning both the live index
    /// and the archive directory so ids are never reused. A row with an
    /// unparseable id means the index is corrupt: fail loudly rather than
    /// guess.
    pub fn next_task_id(&self) -> Result<String, StoreError> {
        let index = self.read_index()?;
        let mut max_num = 0u32;
        for entry in &index.tasks {
            let num = parse_task_num(&entry.id)
                .ok_or_else(|| StoreError::CorruptIndex(format!("bad task id: {}", entry.id)))?;
            max_num = max_num.max(num);
        }

        let archive = self.archive_dir();
        if archive.exists() {
            let entries = std::fs::read_dir(&archive).map_err(|source| StoreError::Io {
                path: archive.display().to_string(),
                source,
            })?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                // Stray non-task directories in the archive are ignored.
                if let Some(num) = name.to_str().and_then(parse_task_num) {
                    max_num = max_num.max(num);
                }
            }
        }

        Ok(format!("TASK-{:03}", max_num + 1))
    }

    pub(crate) fn add_to_index(&self, task: &Task) -> Result<(), StoreError> {
        let mut index = self.read_index()?;
        index.tasks.push(IndexEntry::from_task(task));
        self.write_index(&index)
    }

    /// Update one entry in place. A missing entry is not an error: the
    /// index is a cache and the caller's task record is authoritative.
    pub fn update_index_entry(
        &self,
        task_id: &str,
        update: impl FnOnce(&mut IndexEntry),
    ) -> Result<(), StoreError> {
        let mut index = self.read_index()?;
        match index.entry_mut(task_id) {
            Some(entry) => update(entry),
            None => {
                warn!("index entry for {} missing; skipping update", task_id);
                return Ok(());
            }
        }
        self.write_index(&index)
    }

    pub(crate) fn remove_from_index(&self, task_id: &str) -> Result<(), StoreError> {
        let mut index = self.read_index()?;
        index.tasks.retain(|e| e.id != task_id);
        self.write_index(&index)
    }

    /// Rebuild `index.json` by walking the `TASK-*` directories (the
    /// archive is not indexed). Unreadable or invalid records are skipped
    /// and reported, never fatal.
    pub fn rebuild_index(&self) -> Result<RebuildReport, StoreError> {
        let mut found: Vec<IndexEntry> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        let entries = std::fs::read_dir(self.root()).map_err(|source| StoreError::Io {
            path: self.root().display().to_string(),
            source,
        })?;
        let mut dirs: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with("TASK-"))
            .collect();
        dirs.sort();

        for name in dirs {
            let task_path = self.task_dir(&name).join("task.json");
            if !task_path.exists() {
                warn!("no task.json in {}, skipping", name);
                skipped.push(name);
                continue;
            }
            let task: Task = match read_json(&task_path) {
                Ok(task) => task,
                Err(err) => {
                    warn!("cannot read {}/task.json: {}", name, err);
                    skipped.push(name);
                    continue;
                }
            };

            let mut entry = IndexEntry::from_task(&task);
            entry.subtasks_done = task
                .subtasks
                .iter()
                .filter_map(|sid| self.read_subtask(&task.id, sid).ok().flatten())
                .filter(|st| st.status == SubtaskStatus::Done)
                .count();
            found.push(entry);
        }

        let report = RebuildReport {
            rebuilt: found.iter().map(|e| e.id.clone()).collect(),
            skipped,
        };
        self.write_index(&TaskIndex {
            version: 1,
            tasks: found,
        })?;
        Ok(report)
    }
}

fn parse_task_num(id: &str) -> Option<u32> {
    id.strip_prefix("TASK-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use crate::store::{test_store, NewSubtask};

    #[test]
    fn missing_index_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let index = store.read_index().unwrap();
        assert_eq!(index.version, 1);
        assert!(index.tasks.is_empty());
        assert_eq!(store.next_task_id().unwrap(), "TASK-001");
    }

    #[test]
    fn corrupt_index_id_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let mut index = TaskIndex::default();
        let task = Task::new("WAT-1", "broken", Priority::P1, "");
        index.tasks.push(IndexEntry::from_task(&task));
        store.write_index(&index).unwrap();
        assert!(matches!(
            store.next_task_id().unwrap_err(),
            StoreError::CorruptIndex(_)
        ));
    }

    #[test]
    fn update_missing_entry_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        store.update_index_entry("TASK-999", |e| e.subtask_count = 7).unwrap();
        assert!(store.read_index().unwrap().tasks.is_empty());
    }

    #[test]
    fn rebuild_restores_rows_and_skips_junk() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("keep me", Priority::P1, None, "").unwrap();
        store
            .create_subtask(&task.id, NewSubtask {
                title: "work".into(),
                ..Default::default()
            })
            .unwrap();

        // A task directory with an unreadable record.
        std::fs::create_dir_all(dir.path().join("TASK-099")).unwrap();
        std::fs::write(dir.path().join("TASK-099/task.json"), "{broken").unwrap();
        // Blow away the index entirely.
        std::fs::remove_file(dir.path().join("index.json")).unwrap();

        let report = store.rebuild_index().unwrap();
        assert_eq!(report.rebuilt, vec!["TASK-001"]);
        assert_eq!(report.skipped, vec!["TASK-099"]);

        let index = store.read_index().unwrap();
        assert_eq!(index.tasks.len(), 1);
        assert_eq!(index.tasks[0].subtask_count, 1);
    }
}
