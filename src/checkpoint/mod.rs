//! Per-phase checkpoints on a task's dedicated branch.
//!
//! Every approved phase produces exactly one commit, recorded as a
//! [`Checkpoint`]. Rewinds move the task branch back to the state at the
//! start of a phase; forks start a new task branch from a checkpoint.

pub mod git;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::VcsError;
use crate::state::{PhaseStatus, TaskState};

pub use git::GitVersionControl;

/// A task's isolated branch and working tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRef {
    pub branch: String,
    pub path: PathBuf,
    /// Commit the branch was created from.
    pub base_commit: String,
}

/// Immutable record of one approved phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u32,
    pub phase: String,
    pub commit: String,
    pub label: String,
    #[serde(default)]
    pub files_changed: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Kept for history by a soft rewind but no longer on the active path.
    #[serde(default)]
    pub superseded: bool,
}

/// Version-control operations the engine needs, scoped per task workspace.
pub trait VersionControl: Send + Sync {
    fn create_workspace(&self, task_id: &str) -> Result<WorkspaceRef, VcsError>;
    fn fork_workspace(&self, task_id: &str, commit: &str) -> Result<WorkspaceRef, VcsError>;
    fn remove_workspace(&self, ws: &WorkspaceRef) -> Result<(), VcsError>;
    fn head(&self, ws: &WorkspaceRef) -> Result<Option<String>, VcsError>;
    /// Commit everything in the working tree, even when nothing changed.
    fn commit(&self, ws: &WorkspaceRef, message: &str) -> Result<String, VcsError>;
    /// Reset the branch and working tree to `commit`. Without `force`, a
    /// dirty working tree is refused.
    fn checkout(&self, ws: &WorkspaceRef, commit: &str, force: bool) -> Result<(), VcsError>;
    fn is_dirty(&self, ws: &WorkspaceRef) -> Result<bool, VcsError>;
    fn changed_files(&self, ws: &WorkspaceRef, from: &str, to: &str)
    -> Result<Vec<String>, VcsError>;
    /// Keep `commit` reachable under a named ref.
    fn pin(&self, name: &str, commit: &str) -> Result<(), VcsError>;
    fn unpin(&self, name: &str) -> Result<(), VcsError>;
}

fn pin_name(task_id: &str, seq: u32) -> String {
    format!("{}/{}", task_id, seq)
}

fn workspace(state: &TaskState) -> Result<&WorkspaceRef, VcsError> {
    state
        .task
        .workspace
        .as_ref()
        .ok_or_else(|| VcsError::WorkspaceMissing {
            task_id: state.task.id.clone(),
        })
}

/// Checkpoint bookkeeping over a [`VersionControl`] backend.
///
/// Methods that touch the repository never mutate `TaskState`; methods that
/// mutate `TaskState` never touch the repository. Callers persist state
/// between the two so every truncation is durable before the working tree
/// moves.
pub struct CheckpointManager<'a> {
    vcs: &'a dyn VersionControl,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(vcs: &'a dyn VersionControl) -> Self {
        Self { vcs }
    }

    /// Commit the working tree for an approved phase and return the record
    /// to append. The commit is pinned so later rewinds cannot lose it.
    pub fn commit_phase(&self, state: &TaskState, phase: &str) -> Result<Checkpoint, VcsError> {
        let ws = workspace(state)?;
        let parent = self
            .vcs
            .head(ws)?
            .unwrap_or_else(|| ws.base_commit.clone());
        let label = format!("[taskforge] {} {}", state.task.id, phase);
        let commit = self.vcs.commit(ws, &label)?;
        let seq = state.next_checkpoint_seq.max(1);
        self.vcs.pin(&pin_name(&state.task.id, seq), &commit)?;
        let files_changed = self.vcs.changed_files(ws, &parent, &commit)?;

        tracing::info!(
            task_id = %state.task.id,
            phase,
            seq,
            commit = %commit,
            files = files_changed.len(),
            "Checkpoint created"
        );
        Ok(Checkpoint {
            seq,
            phase: phase.to_string(),
            commit,
            label,
            files_changed,
            created_at: Utc::now(),
            superseded: false,
        })
    }

    /// Commit the working tree should be at when `phase` starts: the last
    /// active checkpoint of an earlier phase, or the workspace base.
    pub fn phase_start_commit(state: &TaskState, phase: &str) -> Result<String, VcsError> {
        let ws = workspace(state)?;
        let Some(pos) = state.plan.position(phase) else {
            return Ok(ws.base_commit.clone());
        };
        let earlier: Vec<&str> = state.plan.ids().take(pos).collect();
        Ok(state
            .active_checkpoints()
            .filter(|c| earlier.contains(&c.phase.as_str()))
            .last()
            .map(|c| c.commit.clone())
            .unwrap_or_else(|| ws.base_commit.clone()))
    }

    /// Truncate state back to the start of `target`. Records for `target`
    /// and every later phase go back to `pending`; their checkpoints are
    /// removed (`hard`) or marked superseded (soft). Returns the pin names
    /// that should be released after the state is persisted.
    pub fn truncate(state: &mut TaskState, target: &str, hard: bool) -> Vec<String> {
        let Some(pos) = state.plan.position(target) else {
            return Vec::new();
        };
        let later: Vec<String> = state.plan.ids().skip(pos).map(str::to_string).collect();

        for id in &later {
            if let Some(record) = state.phase_mut(id) {
                record.reset_to_pending();
            }
        }
        if let Some(record) = state.phase_mut(target) {
            record.force_run = true;
        }

        let mut released = Vec::new();
        if hard {
            let task_id = state.task.id.clone();
            state.checkpoints.retain(|c| {
                let keep = !later.contains(&c.phase);
                if !keep {
                    released.push(pin_name(&task_id, c.seq));
                }
                keep
            });
        } else {
            for checkpoint in state.checkpoints.iter_mut() {
                if later.contains(&checkpoint.phase) {
                    checkpoint.superseded = true;
                }
            }
        }
        released
    }

    /// Move the working tree to `commit`.
    pub fn restore(&self, state: &TaskState, commit: &str, force: bool) -> Result<(), VcsError> {
        let ws = workspace(state)?;
        self.vcs.checkout(ws, commit, force)?;
        tracing::info!(task_id = %state.task.id, commit, "Working tree restored");
        Ok(())
    }

    /// Make sure the working tree sits on `expected` before a phase starts.
    /// Uncommitted work on the right commit (a paused phase) is kept.
    pub fn ensure_at(&self, state: &TaskState, expected: &str) -> Result<(), VcsError> {
        let ws = workspace(state)?;
        if self.vcs.head(ws)?.as_deref() == Some(expected) {
            return Ok(());
        }
        tracing::warn!(
            task_id = %state.task.id,
            expected,
            "Workspace HEAD does not match recorded state; restoring"
        );
        self.vcs.checkout(ws, expected, true)
    }

    pub fn release(&self, pins: &[String]) -> Result<(), VcsError> {
        for pin in pins {
            self.vcs.unpin(pin)?;
        }
        Ok(())
    }

    /// Create a workspace for `new_task_id` at the active checkpoint of
    /// `phase`. The source task is only read.
    pub fn fork(
        &self,
        source: &TaskState,
        phase: &str,
        new_task_id: &str,
    ) -> Result<(WorkspaceRef, Checkpoint), VcsError> {
        let checkpoint = source
            .checkpoint_for(phase)
            .or_else(|| source.checkpoints.iter().rev().find(|c| c.phase == phase))
            .ok_or_else(|| VcsError::CheckpointMissing {
                commit: format!("{}:{}", source.task.id, phase),
            })?
            .clone();
        let ws = self.vcs.fork_workspace(new_task_id, &checkpoint.commit)?;
        Ok((ws, checkpoint))
    }

    /// Seed a forked task's records from the source: phases up to and
    /// including the fork point are completed with copied checkpoints.
    pub fn seed_fork(fork: &mut TaskState, source: &TaskState, phase: &str) -> Vec<(u32, String)> {
        let Some(pos) = source.plan.position(phase) else {
            return Vec::new();
        };
        let done: Vec<&str> = source.plan.ids().take(pos + 1).collect();
        let mut pins = Vec::new();
        for checkpoint in source.active_checkpoints() {
            if !done.contains(&checkpoint.phase.as_str()) {
                continue;
            }
            let seq = fork.next_checkpoint_seq.max(1);
            fork.next_checkpoint_seq = seq + 1;
            fork.checkpoints.push(Checkpoint {
                seq,
                superseded: false,
                ..checkpoint.clone()
            });
            pins.push((seq, checkpoint.commit.clone()));
        }
        for id in done {
            let source_record = source.phase(id);
            if let Some(record) = fork.phase_mut(id) {
                match source_record {
                    Some(src) if src.status == PhaseStatus::Skipped => {
                        record.status = PhaseStatus::Skipped;
                        record.skip_reason = src.skip_reason.clone();
                    }
                    Some(src) => {
                        record.status = PhaseStatus::Completed;
                        record.iterations = src.iterations;
                        record.completed_at = src.completed_at;
                    }
                    None => record.status = PhaseStatus::Completed,
                }
            }
        }
        pins
    }

    pub fn pin_fork(&self, task_id: &str, pins: &[(u32, String)]) -> Result<(), VcsError> {
        for (seq, commit) in pins {
            self.vcs.pin(&pin_name(task_id, *seq), commit)?;
        }
        Ok(())
    }

    /// Pin names held by every checkpoint of `state`, superseded included.
    pub fn pins(state: &TaskState) -> Vec<String> {
        state
            .checkpoints
            .iter()
            .map(|c| pin_name(&state.task.id, c.seq))
            .collect()
    }

    /// Release every pin and reset the working tree to the workspace base.
    pub fn reset_all(&self, state: &TaskState) -> Result<(), VcsError> {
        self.release(&Self::pins(state))?;
        if let Some(ws) = &state.task.workspace {
            self.vcs.checkout(ws, &ws.base_commit, true)?;
        }
        Ok(())
    }
}
