//! Task record and the task-level state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::WorkspaceRef;
use crate::errors::FailureCause;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planned,
    Running,
    Paused,
    Blocked,
    Interrupted,
    Orphaned,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Interrupted => "interrupted",
            Self::Orphaned => "orphaned",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// Statuses from which `run` may acquire a lease and start executing.
    pub fn can_run(&self) -> bool {
        matches!(
            self,
            Self::Planned
                | Self::Paused
                | Self::Blocked
                | Self::Interrupted
                | Self::Orphaned
                | Self::Failed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planned" => Ok(Self::Planned),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "blocked" => Ok(Self::Blocked),
            "interrupted" => Ok(Self::Interrupted),
            "orphaned" => Ok(Self::Orphaned),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Task-level transition table.
///
/// `rewind` may target any non-running status and `reset` any non-running
/// status; everything else follows the run/pause/stop/resolve edges.
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (f, Running) => f.can_run(),
        (Running, Completed | Failed | Blocked | Paused | Interrupted | Orphaned) => true,
        (Orphaned, Interrupted) => true,
        (Failed, Completed) => true,
        (f, Planned | Paused) => f != Running,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Weight {
    Trivial,
    Small,
    Medium,
    Large,
}

impl Weight {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl std::fmt::Display for Weight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weight {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trivial" => Ok(Self::Trivial),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(format!(
                "Invalid weight '{}'. Valid values: trivial, small, medium, large",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    #[default]
    Feature,
    Bug,
    Refactor,
    Chore,
    Docs,
    Test,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Refactor => "refactor",
            Self::Chore => "chore",
            Self::Docs => "docs",
            Self::Test => "test",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feature" => Ok(Self::Feature),
            "bug" => Ok(Self::Bug),
            "refactor" => Ok(Self::Refactor),
            "chore" => Ok(Self::Chore),
            "docs" => Ok(Self::Docs),
            "test" => Ok(Self::Test),
            _ => Err(format!("Invalid category: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub message: String,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub weight: Weight,
    #[serde(default)]
    pub category: Category,
    pub status: TaskStatus,
    #[serde(default)]
    pub current_phase: Option<String>,
    #[serde(default)]
    pub workspace: Option<WorkspaceRef>,
    /// Session handle returned by the agent, reused on later invocations.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Max cross-phase retries for this task; falls back to the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    #[serde(default)]
    pub failure: Option<FailureCause>,
    /// Task this one was forked from, as `(task_id, phase)`.
    #[serde(default)]
    pub forked_from: Option<(String, String)>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Move to `to` if the transition table allows it.
    pub fn transition(&mut self, to: TaskStatus, action: &'static str) -> crate::errors::Result<()> {
        if !is_valid_transition(self.status, to) {
            return Err(crate::errors::EngineError::invalid(&self.id, self.status, action));
        }
        self.status = to;
        Ok(())
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub weight: Weight,
    pub category: Category,
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(title: impl Into<String>, weight: Weight) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            weight,
            category: Category::default(),
            max_retries: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Format a sequential task id.
pub fn format_task_id(seq: u32) -> String {
    format!("TASK-{:03}", seq)
}

/// Parse the sequence number out of a task id produced by [`format_task_id`].
pub fn parse_task_seq(id: &str) -> Option<u32> {
    id.strip_prefix("TASK-")?.parse().ok()
}
