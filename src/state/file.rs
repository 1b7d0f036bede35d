//! JSON-file state store.
//!
//! Layout under the store directory:
//!
//! ```text
//! tasks/
//! ├── .registry.lock   # serializes task creation and deletion
//! ├── .seq             # highest task sequence ever issued
//! ├── TASK-001.json    # one TaskState document per task
//! ├── TASK-001.lock    # serializes read-modify-write of TASK-001
//! └── ...
//! ```
//!
//! Documents are replaced with write-to-temp + rename, so a reader (or a
//! process restarting after a crash) sees either the old or the new state,
//! never a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::errors::{EngineError, Result};
use crate::task::{format_task_id, parse_task_seq};

use super::{Mutation, StateStore, TaskState};

const REGISTRY_LOCK: &str = ".registry.lock";
const SEQ_FILE: &str = ".seq";

pub struct FileStateStore {
    dir: PathBuf,
}

/// Holds an exclusive advisory lock until dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

fn valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn doc_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    fn lock(&self, name: &str) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.dir.join(name))?;
        file.lock_exclusive()?;
        Ok(LockGuard(file))
    }

    fn lock_task(&self, task_id: &str) -> Result<LockGuard> {
        self.lock(&format!("{}.lock", task_id))
    }

    fn read(&self, task_id: &str) -> Result<TaskState> {
        if !valid_task_id(task_id) {
            return Err(EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        let content = match fs::read_to_string(self.doc_path(task_id)) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::TaskNotFound {
                    task_id: task_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| EngineError::Corrupted {
            task_id: task_id.to_string(),
            message: e.to_string(),
        })
    }

    fn write(&self, state: &TaskState) -> Result<()> {
        let path = self.doc_path(&state.task.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", state.task.id));
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::Other(anyhow::Error::new(e).context("serializing task state")))?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Next free sequence. Takes the persisted high-water mark into account
    /// so the id of a deleted task is never issued again.
    fn next_seq(&self) -> Result<u32> {
        let issued = match fs::read_to_string(self.dir.join(SEQ_FILE)) {
            Ok(content) => content.trim().parse::<u32>().unwrap_or(0),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(self.max_seq()?.max(issued) + 1)
    }

    fn max_seq(&self) -> Result<u32> {
        let mut max = 0;
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Some(seq) = parse_task_seq(stem) {
                max = max.max(seq);
            }
        }
        Ok(max)
    }
}

impl StateStore for FileStateStore {
    fn create_task(&self, init: &mut dyn FnMut(String) -> Result<TaskState>) -> Result<TaskState> {
        let _registry = self.lock(REGISTRY_LOCK)?;
        let seq = self.next_seq()?;
        let task_id = format_task_id(seq);
        let state = init(task_id.clone())?;
        if state.task.id != task_id {
            return Err(EngineError::InvalidRequest(format!(
                "initializer returned task {} for allocated id {}",
                state.task.id, task_id
            )));
        }
        let _task = self.lock_task(&task_id)?;
        self.write(&state)?;
        fs::write(self.dir.join(SEQ_FILE), seq.to_string())?;
        tracing::debug!(task_id = %task_id, "Task created");
        Ok(state)
    }

    fn load(&self, task_id: &str) -> Result<TaskState> {
        self.read(task_id)
    }

    fn list(&self) -> Result<Vec<TaskState>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json"))
                && !stem.starts_with('.')
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort_by_key(|id| (parse_task_seq(id).unwrap_or(u32::MAX), id.clone()));

        let mut states = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read(&id) {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!(task_id = %id, error = %e, "Skipping unreadable task"),
            }
        }
        Ok(states)
    }

    fn delete(&self, task_id: &str, stale_after: Duration) -> Result<()> {
        let _registry = self.lock(REGISTRY_LOCK)?;
        let state = self.read(task_id)?;
        {
            let _task = self.lock_task(task_id)?;
            if let Some(lease) = state.live_lease(stale_after) {
                return Err(EngineError::AlreadyRunning {
                    task_id: task_id.to_string(),
                    holder: lease.holder.clone(),
                });
            }
            fs::remove_file(self.doc_path(task_id))?;
        }
        let _ = fs::remove_file(self.dir.join(format!("{}.lock", task_id)));
        Ok(())
    }

    fn update(&self, task_id: &str, f: Mutation<'_>) -> Result<TaskState> {
        if !valid_task_id(task_id) {
            return Err(EngineError::TaskNotFound {
                task_id: task_id.to_string(),
            });
        }
        let _guard = self.lock_task(task_id)?;
        let mut state = self.read(task_id)?;
        f(&mut state)?;
        state.task.updated_at = chrono::Utc::now();
        self.write(&state)?;
        Ok(state)
    }
}
