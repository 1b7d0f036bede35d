//! In-process state store for single-process embedding and tests.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::errors::{EngineError, Result};
use crate::task::{format_task_id, parse_task_seq};

use super::{Mutation, StateStore, TaskState};

/// Tasks kept in a `RwLock`-guarded map: reads run concurrently, writes
/// (including creation and deletion) are serialized.
#[derive(Default)]
pub struct MemoryStateStore {
    tasks: RwLock<BTreeMap<String, TaskState>>,
    /// Highest sequence ever issued, so deleted ids are not handed out again.
    issued: AtomicU32,
}

fn poisoned() -> EngineError {
    EngineError::Other(anyhow::anyhow!("State lock poisoned"))
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn create_task(&self, init: &mut dyn FnMut(String) -> Result<TaskState>) -> Result<TaskState> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned())?;
        let next = tasks
            .keys()
            .filter_map(|id| parse_task_seq(id))
            .max()
            .unwrap_or(0)
            .max(self.issued.load(Ordering::SeqCst))
            + 1;
        let task_id = format_task_id(next);
        let state = init(task_id.clone())?;
        self.issued.store(next, Ordering::SeqCst);
        tasks.insert(task_id, state.clone());
        Ok(state)
    }

    fn load(&self, task_id: &str) -> Result<TaskState> {
        let tasks = self.tasks.read().map_err(|_| poisoned())?;
        tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<TaskState>> {
        let tasks = self.tasks.read().map_err(|_| poisoned())?;
        let mut states: Vec<TaskState> = tasks.values().cloned().collect();
        states.sort_by_key(|s| parse_task_seq(&s.task.id).unwrap_or(u32::MAX));
        Ok(states)
    }

    fn delete(&self, task_id: &str, stale_after: Duration) -> Result<()> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned())?;
        let state = tasks.get(task_id).ok_or_else(|| EngineError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        if let Some(lease) = state.live_lease(stale_after) {
            return Err(EngineError::AlreadyRunning {
                task_id: task_id.to_string(),
                holder: lease.holder.clone(),
            });
        }
        tasks.remove(task_id);
        Ok(())
    }

    fn update(&self, task_id: &str, f: Mutation<'_>) -> Result<TaskState> {
        let mut tasks = self.tasks.write().map_err(|_| poisoned())?;
        let current = tasks.get(task_id).ok_or_else(|| EngineError::TaskNotFound {
            task_id: task_id.to_string(),
        })?;
        let mut next = current.clone();
        f(&mut next)?;
        next.task.updated_at = chrono::Utc::now();
        tasks.insert(task_id.to_string(), next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Lease;
    use crate::state::test_support::state_for;
    use crate::task::TaskStatus;
    use std::sync::Arc;

    #[test]
    fn test_deleted_id_is_not_reissued() {
        let store = MemoryStateStore::new();
        store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        store.delete("TASK-002", Duration::from_secs(300)).unwrap();
        let next = store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        assert_eq!(next.task.id, "TASK-003");
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let store = MemoryStateStore::new();
        store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        let _ = store.update("TASK-001", &mut |s| {
            s.task.status = TaskStatus::Failed;
            Err(EngineError::InvalidRequest("abort".into()))
        });
        assert_eq!(store.load("TASK-001").unwrap().task.status, TaskStatus::Planned);
    }

    #[test]
    fn test_concurrent_lease_acquisition_has_one_winner() {
        let store = Arc::new(MemoryStateStore::new());
        store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    store.acquire_lease(
                        "TASK-001",
                        Lease::new(format!("w{}", i)),
                        Duration::from_secs(300),
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.into_iter().filter_map(|r| r.err()) {
            assert_eq!(err.kind(), crate::errors::ErrorKind::User);
        }
    }

    #[test]
    fn test_stale_lease_can_be_taken_over() {
        let store = MemoryStateStore::new();
        store.create_task(&mut |id| Ok(state_for(&id))).unwrap();
        let mut old = Lease::new("dead-worker");
        old.heartbeat_at = chrono::Utc::now() - chrono::Duration::minutes(30);
        store
            .acquire_lease("TASK-001", old, Duration::from_secs(300))
            .unwrap();
        let state = store
            .acquire_lease("TASK-001", Lease::new("fresh"), Duration::from_secs(300))
            .unwrap();
        assert_eq!(state.lease.unwrap().holder, "fresh");
    }

    #[test]
    fn test_delete_missing_task() {
        let store = MemoryStateStore::new();
        assert!(matches!(
            store.delete("TASK-001", Duration::from_secs(1)).unwrap_err(),
            EngineError::TaskNotFound { .. }
        ));
    }
}
