//! Classified error hierarchy for the task engine.
//!
//! Every error that crosses the executor or supervisor boundary is an
//! `EngineError`, and every `EngineError` maps to exactly one `ErrorKind`:
//!
//! | Kind             | Examples                                              | Handling                         |
//! |------------------|-------------------------------------------------------|----------------------------------|
//! | `User`           | invalid transition, unknown task/phase, already running | surfaced immediately           |
//! | `Agent`          | agent unavailable, timeout, malformed output          | retried via the retry controller |
//! | `VersionControl` | dirty tree, branch conflict, missing checkpoint       | fatal for the phase              |
//! | `State`          | corrupted record, lost lease                          | fatal for the task only          |
//! | `System`         | anything unexpected                                   | task fails with full chain       |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::task::TaskStatus;

/// Error classification persisted alongside failed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    User,
    Agent,
    VersionControl,
    State,
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::User => "user",
            ErrorKind::Agent => "agent",
            ErrorKind::VersionControl => "version_control",
            ErrorKind::State => "state",
            ErrorKind::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures of the external agent invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Agent timed out after {}s", after.as_secs())]
    Timeout { after: Duration },

    #[error("Malformed agent output: {0}")]
    Malformed(String),

    #[error("Agent exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Iteration budget of {iterations} exhausted without a completion marker")]
    BudgetExhausted { iterations: u32 },
}

/// Failures of the version-control collaborator.
#[derive(Debug, Error)]
pub enum VcsError {
    #[error("Working tree at {path} has uncommitted changes")]
    DirtyWorkingTree { path: std::path::PathBuf },

    #[error("Branch '{branch}' already exists")]
    BranchConflict { branch: String },

    #[error("Checkpoint commit {commit} not found")]
    CheckpointMissing { commit: String },

    #[error("Task {task_id} has no workspace")]
    WorkspaceMissing { task_id: String },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Workspace I/O failed at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Plan construction failures. Always fatal, never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("Plan has no phases")]
    Empty,

    #[error("Duplicate phase id '{0}'")]
    DuplicatePhase(String),

    #[error("Unknown dependency '{dependency}' in phase '{phase}'")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Plan contains a dependency cycle involving: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("Invalid plan template: {0}")]
    Template(String),
}

/// The single error type returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task {task_id} not found")]
    TaskNotFound { task_id: String },

    #[error("Phase '{phase}' not found in task {task_id}")]
    PhaseNotFound { task_id: String, phase: String },

    #[error("Cannot {action} task {task_id} while it is {status}")]
    InvalidTransition {
        task_id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("Task {task_id} is already running (lease held by {holder})")]
    AlreadyRunning { task_id: String, holder: String },

    #[error("Worker pool exhausted ({limit} tasks already running)")]
    WorkerPoolExhausted { limit: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    VersionControl(#[from] VcsError),

    #[error("State for task {task_id} is corrupted: {message}")]
    Corrupted { task_id: String, message: String },

    #[error("Lease on task {task_id} is no longer held by {holder}")]
    LeaseLost { task_id: String, holder: String },

    #[error("State store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::TaskNotFound { .. }
            | EngineError::PhaseNotFound { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::AlreadyRunning { .. }
            | EngineError::WorkerPoolExhausted { .. }
            | EngineError::InvalidRequest(_)
            | EngineError::Plan(_) => ErrorKind::User,
            EngineError::Agent(_) => ErrorKind::Agent,
            EngineError::VersionControl(_) => ErrorKind::VersionControl,
            EngineError::Corrupted { .. } | EngineError::LeaseLost { .. } => ErrorKind::State,
            EngineError::Io(_) | EngineError::Other(_) => ErrorKind::System,
        }
    }

    /// Agent failures are the only kind the retry controller may absorb.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Agent
    }

    pub(crate) fn invalid(task_id: &str, status: TaskStatus, action: &'static str) -> Self {
        EngineError::InvalidTransition {
            task_id: task_id.to_string(),
            status,
            action,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// The terminal cause retained on a task so later `resolve`, `rewind` or
/// `resume` calls can see what went wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: ErrorKind,
    #[serde(default)]
    pub phase: Option<String>,
    pub message: String,
    #[serde(default)]
    pub chain: Vec<String>,
    pub at: DateTime<Utc>,
}

impl FailureCause {
    pub fn from_error(err: &EngineError, phase: Option<&str>) -> Self {
        let chain = match err {
            EngineError::Other(inner) => inner.chain().skip(1).map(|c| c.to_string()).collect(),
            _ => {
                let mut chain = Vec::new();
                let mut source = std::error::Error::source(err);
                while let Some(cause) = source {
                    chain.push(cause.to_string());
                    source = cause.source();
                }
                chain
            }
        };
        Self {
            kind: err.kind(),
            phase: phase.map(str::to_string),
            message: err.to_string(),
            chain,
            at: Utc::now(),
        }
    }

    pub fn new(kind: ErrorKind, phase: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase: phase.map(str::to_string),
            message: message.into(),
            chain: Vec::new(),
            at: Utc::now(),
        }
    }
}
