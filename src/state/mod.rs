//! Durable task state.
//!
//! All task, phase, checkpoint, retry, gate and lease data for one task
//! lives in a single [`TaskState`] document. The [`StateStore`] trait is the
//! only way to read or change it; `update` is atomic per task, which is what
//! makes the execution lease a real mutual-exclusion primitive.

pub mod file;
pub mod memory;
pub mod records;

use std::time::Duration;

use chrono::Utc;

use crate::errors::{EngineError, Result};

pub use file::FileStateStore;
pub use memory::MemoryStateStore;
pub use records::{ControlRequest, Lease, PendingGate, PhaseRecord, PhaseStatus, TaskState};

pub type Mutation<'a> = &'a mut dyn FnMut(&mut TaskState) -> Result<()>;

/// Persistence for task state.
///
/// Implementations must make `update` atomic for a task: the closure sees
/// the latest durable state, and either its whole effect is persisted or,
/// when it returns an error, nothing is.
pub trait StateStore: Send + Sync {
    /// Allocate the next task id and persist the state built by `init`.
    /// Creation is serialized across callers.
    fn create_task(&self, init: &mut dyn FnMut(String) -> Result<TaskState>) -> Result<TaskState>;

    fn load(&self, task_id: &str) -> Result<TaskState>;

    /// All readable tasks, ordered by id. Unreadable records are skipped.
    fn list(&self) -> Result<Vec<TaskState>>;

    /// Remove a task. Refused while a live lease is held.
    fn delete(&self, task_id: &str, stale_after: Duration) -> Result<()>;

    /// Atomic read-modify-write of one task.
    fn update(&self, task_id: &str, f: Mutation<'_>) -> Result<TaskState>;

    /// Take the execution lease unless someone else holds a live one.
    fn acquire_lease(&self, task_id: &str, lease: Lease, stale_after: Duration) -> Result<TaskState> {
        self.update(task_id, &mut |state| {
            if let Some(existing) = state.live_lease(stale_after)
                && existing.holder != lease.holder
            {
                return Err(EngineError::AlreadyRunning {
                    task_id: state.task.id.clone(),
                    holder: existing.holder.clone(),
                });
            }
            if let Some(old) = &state.lease
                && old.holder != lease.holder
            {
                tracing::warn!(
                    task_id = %state.task.id,
                    previous = %old.holder,
                    "Replacing dead execution lease"
                );
            }
            state.lease = Some(lease.clone());
            Ok(())
        })
    }

    /// Refresh the heartbeat. Fails with `LeaseLost` if `holder` no longer
    /// owns the lease.
    fn heartbeat(&self, task_id: &str, holder: &str) -> Result<()> {
        self.update(task_id, &mut |state| match state.lease.as_mut() {
            Some(lease) if lease.holder == holder => {
                lease.heartbeat_at = Utc::now();
                Ok(())
            }
            _ => Err(EngineError::LeaseLost {
                task_id: state.task.id.clone(),
                holder: holder.to_string(),
            }),
        })?;
        Ok(())
    }

    /// Drop the lease if `holder` still owns it.
    fn release_lease(&self, task_id: &str, holder: &str) -> Result<()> {
        self.update(task_id, &mut |state| {
            if state.lease.as_ref().is_some_and(|l| l.holder == holder) {
                state.lease = None;
            }
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use super::TaskState;
    use crate::plan::{PlanOptions, PlanTemplate, resolve_plan};
    use crate::task::{Category, Task, TaskStatus, Weight};

    pub fn sample_task(id: &str) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            title: "Add login".into(),
            description: String::new(),
            weight: Weight::Small,
            category: Category::Feature,
            status: TaskStatus::Planned,
            current_phase: None,
            workspace: None,
            session_id: None,
            max_retries: None,
            resolution: None,
            failure: None,
            forked_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn sample_state(ids: &[&str]) -> TaskState {
        let plan = resolve_plan(&PlanTemplate::linear("t", ids), &PlanOptions::default()).unwrap();
        TaskState::new(sample_task("TASK-001"), plan)
    }

    pub fn state_for(id: &str) -> TaskState {
        let plan = resolve_plan(
            &PlanTemplate::linear("t", &["spec", "implement"]),
            &PlanOptions::default(),
        )
        .unwrap();
        TaskState::new(sample_task(id), plan)
    }
}
