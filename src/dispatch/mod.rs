//! Agent selection, readiness gating, and dispatch.
//!
//! The dispatcher decides which subtasks may be handed to a worker and
//! who gets them; it never executes the work. Readiness checks are
//! point-in-time reads — the store re-validates status under the task
//! lock when a decision is committed.

mod context;
mod registry;

pub use context::{DependencySummary, DispatchContext};
pub use registry::{AgentRegistry, AgentSpec};

use serde::Serialize;
use tracing::{debug, info};

use crate::model::{Subtask, SubtaskStatus, Task, TaskStatus};
use crate::store::{StoreError, TaskStore};

/// Outcome of a readiness check. `ready == false` always carries the
/// first failing gate's reason; callers must not dispatch on it.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
    /// The agent that would receive the subtask, when one was resolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl Readiness {
    fn not_ready(reason: impl Into<String>) -> Self {
        Self {
            ready: false,
            reason: reason.into(),
            agent: None,
        }
    }
}

/// One subtask handed to an agent by `auto_dispatch`.
#[derive(Debug, Clone, Serialize)]
pub struct Dispatched {
    pub subtask_id: String,
    pub agent: String,
    pub prompt: String,
}

pub struct Dispatcher<'a> {
    store: &'a TaskStore,
    registry: AgentRegistry,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a TaskStore, registry: AgentRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Evaluate the four dispatch gates in order: parent status, subtask
    /// status, dependency completion, agent capacity. The first failure
    /// wins.
    pub fn check_readiness(
        &self,
        task: &Task,
        subtask: &Subtask,
        all_subtasks: &[Subtask],
    ) -> Result<Readiness, StoreError> {
        if !matches!(task.status, TaskStatus::Approved | TaskStatus::InProgress) {
            return Ok(Readiness::not_ready(format!(
                "task {} is {}, not APPROVED/IN_PROGRESS",
                task.id, task.status
            )));
        }
        if !matches!(subtask.status, SubtaskStatus::Pending | SubtaskStatus::Assigned) {
            return Ok(Readiness::not_ready(format!(
                "subtask {} is {}, not dispatchable",
                subtask.id, subtask.status
            )));
        }
        for dep_id in &subtask.dependencies {
            match all_subtasks.iter().find(|s| &s.id == dep_id) {
                Some(dep) if dep.status == SubtaskStatus::Done => {}
                Some(dep) => {
                    return Ok(Readiness::not_ready(format!(
                        "dependency {} is {}, not DONE",
                        dep_id, dep.status
                    )))
                }
                None => {
                    return Ok(Readiness::not_ready(format!(
                        "dependency {dep_id} does not resolve to a subtask"
                    )))
                }
            }
        }

        let agent_id = self
            .registry
            .select_agent(subtask.kind, subtask.assignment.agent.as_deref())
            .to_string();
        if let Some(agent) = self.registry.get(&agent_id) {
            let active = self.active_agent_count(&agent_id)?;
            if active >= agent.max_parallel {
                return Ok(Readiness::not_ready(format!(
                    "agent {} at capacity ({}/{})",
                    agent_id, active, agent.max_parallel
                )));
            }
        }

        Ok(Readiness {
            ready: true,
            reason: "ready".into(),
            agent: Some(agent_id),
        })
    }

    /// Count the agent's IN_PROGRESS subtasks across all active tasks.
    ///
    /// Deliberately a live scan, not a cached counter: independent
    /// processes dispatch concurrently and a counter would drift across
    /// restarts. Runs only at dispatch time.
    pub fn active_agent_count(&self, agent_id: &str) -> Result<usize, StoreError> {
        let mut count = 0;
        for entry in self.store.list_tasks(false)? {
            for subtask in self.store.read_all_subtasks(&entry.id)? {
                if subtask.status == SubtaskStatus::InProgress
                    && subtask.assignment.agent.as_deref() == Some(agent_id)
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Build the dispatch context for one subtask, resolving its agent.
    pub fn context_for(
        &self,
        task: &Task,
        subtask: &Subtask,
        all_subtasks: &[Subtask],
    ) -> DispatchContext {
        let agent_id = self
            .registry
            .select_agent(subtask.kind, subtask.assignment.agent.as_deref());
        // select_agent only returns registered ids or the fallback; an
        // unregistered fallback gets a minimal synthetic spec.
        match self.registry.get(agent_id) {
            Some(agent) => DispatchContext::build(task, subtask, all_subtasks, agent),
            None => DispatchContext::build(
                task,
                subtask,
                all_subtasks,
                &AgentSpec {
                    id: agent_id.to_string(),
                    capabilities: vec![],
                    preferred: vec![],
                    max_parallel: 1,
                    dispatch_method: "cli".into(),
                },
            ),
        }
    }

    /// Dispatch every ready subtask of one task: gate, build the prompt,
    /// and commit the assignment through the store. Capacity is re-scanned
    /// per subtask, so a batch never overfills an agent with concurrent
    /// work already in flight.
    pub fn auto_dispatch(&self, task_id: &str) -> Result<Vec<Dispatched>, StoreError> {
        let task = self.store.require_task(task_id)?;
        let all_subtasks = self.store.read_all_subtasks(task_id)?;
        let mut dispatched = Vec::new();

        for subtask in &all_subtasks {
            let readiness = self.check_readiness(&task, subtask, &all_subtasks)?;
            if !readiness.ready {
                debug!("{}/{}: {}", task_id, subtask.id, readiness.reason);
                continue;
            }
            let Some(agent_id) = readiness.agent.clone() else {
                continue;
            };
            let context = self.context_for(&task, subtask, &all_subtasks);
            let prompt = context.prompt();

            self.store
                .commit_auto_dispatch(task_id, &subtask.id, &agent_id, &prompt)?;
            info!("dispatched {}/{} to {}", task_id, subtask.id, agent_id);
            dispatched.push(Dispatched {
                subtask_id: subtask.id.clone(),
                agent: agent_id,
                prompt,
            });
        }
        Ok(dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;
    use crate::state::TaskEvent;
    use crate::store::{test_store, NewSubtask};

    fn ready_task(store: &TaskStore) -> String {
        let task = store.create_task("Add login", Priority::P1, None, "").unwrap();
        store
            .transition_task(&task.id, TaskEvent::Approve, "user", Some("ok"))
            .unwrap();
        task.id
    }

    #[test]
    fn unmet_dependency_blocks_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = ready_task(&store);
        store
            .create_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_subtask(&task_id, NewSubtask {
                title: "verify".into(),
                deps: vec!["subtask_01".into()],
                ..Default::default()
            })
            .unwrap();

        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let task = store.require_task(&task_id).unwrap();
        let all = store.read_all_subtasks(&task_id).unwrap();

        // The dependent was created BLOCKED, so the status gate fires
        // before the dependency gate is even consulted.
        let readiness = dispatcher.check_readiness(&task, &all[1], &all).unwrap();
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("BLOCKED"));
        assert!(readiness.reason.contains("not dispatchable"));
    }

    #[test]
    fn pending_subtask_with_unmet_dependency_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = ready_task(&store);
        store
            .create_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_subtask(&task_id, NewSubtask {
                title: "verify".into(),
                deps: vec!["subtask_01".into()],
                ..Default::default()
            })
            .unwrap();
        // Force the dependent to PENDING so the dependency gate itself is
        // what rejects it, not the status gate.
        let mut st = store.require_subtask(&task_id, "subtask_02").unwrap();
        st.status = SubtaskStatus::Pending;
        store.save_subtask(&st).unwrap();

        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let task = store.require_task(&task_id).unwrap();
        let all = store.read_all_subtasks(&task_id).unwrap();
        let readiness = dispatcher.check_readiness(&task, &all[1], &all).unwrap();
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("subtask_01"));
        assert!(readiness.reason.contains("not DONE"));

        // A dependency that resolves to nothing is equally disqualifying.
        let mut dangling = store.require_subtask(&task_id, "subtask_02").unwrap();
        dangling.dependencies = vec!["subtask_99".into()];
        store.save_subtask(&dangling).unwrap();
        let all = store.read_all_subtasks(&task_id).unwrap();
        let readiness = dispatcher.check_readiness(&task, &all[1], &all).unwrap();
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("subtask_99"));
    }

    #[test]
    fn dependency_done_restores_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = ready_task(&store);
        store
            .create_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_subtask(&task_id, NewSubtask {
                title: "verify".into(),
                kind: crate::model::SubtaskType::Test,
                deps: vec!["subtask_01".into()],
                ..Default::default()
            })
            .unwrap();

        let mut dep = store.require_subtask(&task_id, "subtask_01").unwrap();
        dep.status = SubtaskStatus::Done;
        store.save_subtask(&dep).unwrap();
        // The dependent was created BLOCKED; completing the dependency out
        // of band leaves it there, so unblock it the way the cascade does.
        let mut st = store.require_subtask(&task_id, "subtask_02").unwrap();
        st.status = SubtaskStatus::Pending;
        st.blocked_by.clear();
        store.save_subtask(&st).unwrap();

        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let task = store.require_task(&task_id).unwrap();
        let all = store.read_all_subtasks(&task_id).unwrap();
        let readiness = dispatcher.check_readiness(&task, &all[1], &all).unwrap();
        assert!(readiness.ready);
        assert_eq!(readiness.agent.as_deref(), Some("test-runner"));
    }

    #[test]
    fn agent_at_capacity_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = ready_task(&store);
        // Fill claude-code's two slots with in-progress subtasks.
        for title in ["one", "two"] {
            let st = store
                .create_subtask(&task_id, NewSubtask {
                    title: title.into(),
                    agent: Some("claude-code".into()),
                    ..Default::default()
                })
                .unwrap();
            let mut st = store.require_subtask(&task_id, &st.id).unwrap();
            st.status = SubtaskStatus::InProgress;
            store.save_subtask(&st).unwrap();
        }
        let third = store
            .create_subtask(&task_id, NewSubtask {
                title: "three".into(),
                agent: Some("claude-code".into()),
                ..Default::default()
            })
            .unwrap();

        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let task = store.require_task(&task_id).unwrap();
        let all = store.read_all_subtasks(&task_id).unwrap();
        let subtask = all.iter().find(|s| s.id == third.id).unwrap();
        let readiness = dispatcher.check_readiness(&task, subtask, &all).unwrap();
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("capacity"));
    }

    #[test]
    fn planning_task_is_never_dispatchable() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task = store.create_task("not approved", Priority::P1, None, "").unwrap();
        let st = store
            .create_subtask(&task.id, NewSubtask {
                title: "impl".into(),
                ..Default::default()
            })
            .unwrap();
        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let task = store.require_task(&task.id).unwrap();
        let readiness = dispatcher
            .check_readiness(&task, &st, std::slice::from_ref(&st))
            .unwrap();
        assert!(!readiness.ready);
        assert!(readiness.reason.contains("PLANNING"));
    }

    #[test]
    fn auto_dispatch_assigns_ready_and_skips_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(dir.path());
        let task_id = ready_task(&store);
        store
            .create_subtask(&task_id, NewSubtask {
                title: "impl".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .create_subtask(&task_id, NewSubtask {
                title: "verify".into(),
                kind: crate::model::SubtaskType::Test,
                deps: vec!["subtask_01".into()],
                ..Default::default()
            })
            .unwrap();

        let dispatcher = Dispatcher::new(&store, AgentRegistry::with_defaults());
        let dispatched = dispatcher.auto_dispatch(&task_id).unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].subtask_id, "subtask_01");
        assert_eq!(dispatched[0].agent, "claude-code");
        assert!(dispatched[0].prompt.contains("impl"));

        let st = store.require_subtask(&task_id, "subtask_01").unwrap();
        assert_eq!(st.status, SubtaskStatus::Assigned);
        // Auto-start fired on the APPROVED parent.
        assert_eq!(store.require_task(&task_id).unwrap().status, TaskStatus::InProgress);
    }
}
