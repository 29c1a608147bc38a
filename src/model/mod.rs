//! Plain records persisted by the task store.
//!
//! No validation logic lives here; status changes are validated by
//! `crate::state` and committed by `crate::store`. The only behavior these
//! types carry is invariant-preserving mutation: `add_history` keeps the
//! audit trail in lockstep with every field change.

mod history;
mod index;
mod status;
mod subtask;
mod task;

pub use history::HistoryEntry;
pub use index::{IndexEntry, TaskIndex};
pub use status::{Priority, SubtaskStatus, SubtaskType, TaskStatus};
pub use subtask::{Assignment, Progress, Subtask, SubtaskResult, SUBTASK_SCHEMA};
pub use task::{ChannelBinding, Plan, Task, TaskMetadata, Timeline, TASK_SCHEMA};

/// Current time as an RFC 3339 string, the timestamp format of every
/// persisted record.
pub fn now_string() -> String {
    chrono::Utc::now().to_rfc3339()
}
