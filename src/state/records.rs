//! Persisted records: phase execution records, leases, and the per-task
//! aggregate that the store reads and writes as one unit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::gates::GateDecision;
use crate::plan::{PhaseSpec, Plan};
use crate::retry::{RetryContext, RetryRecord};
use crate::task::Task;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Skipped,
    Blocked,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    /// Completed or skipped: the phase no longer needs to run.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output held while a human gate decides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingGate {
    pub output: String,
    pub approved: bool,
}

/// Execution state of one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub blocked_reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Feedback from the last gate rejection, shown on the next attempt.
    #[serde(default)]
    pub feedback: Option<String>,
    /// Set after a rewind, rejection, or retry so artifacts cannot skip it.
    #[serde(default)]
    pub force_run: bool,
    /// Skip suggested by the artifact inspector, waiting for confirmation.
    #[serde(default)]
    pub skip_suggestion: Option<String>,
    #[serde(default)]
    pub pending_gate: Option<PendingGate>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn new(phase: &str) -> Self {
        Self {
            phase: phase.to_string(),
            ..Self::default()
        }
    }

    /// Back to a fresh `pending` record. The retry count survives; only
    /// `reset` clears it.
    pub fn reset_to_pending(&mut self) {
        let retries = self.retries;
        *self = Self::new(&self.phase);
        self.retries = retries;
    }
}

/// Durable pause/stop request, honoured by whichever process holds the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlRequest {
    Pause,
    Stop,
}

pub(crate) fn get_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence without delivering anything. EPERM means the
    // process exists but belongs to someone else.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

/// Exclusive execution lease for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub hostname: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            holder: holder.into(),
            hostname: get_hostname(),
            pid: std::process::id(),
            acquired_at: now,
            heartbeat_at: now,
        }
    }

    /// Heartbeat older than `threshold`. A heartbeat from the future (clock
    /// skew) also counts as stale so recovery is never blocked forever.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.heartbeat_at);
        elapsed.to_std().map(|d| d > threshold).unwrap_or(true)
    }

    /// `false` only when the holder is on this host and its pid is gone.
    /// Holders on other hosts are judged by heartbeat alone.
    pub fn holder_alive(&self) -> bool {
        if self.hostname != get_hostname() {
            return true;
        }
        is_process_running(self.pid)
    }

    /// Why this lease no longer protects the task, if it doesn't.
    pub fn dead_reason(&self, threshold: Duration) -> Option<String> {
        if self.is_stale(threshold) {
            return Some(format!(
                "heartbeat from {} is older than {}s",
                self.holder,
                threshold.as_secs()
            ));
        }
        if !self.holder_alive() {
            return Some(format!("holder process {} is no longer running", self.pid));
        }
        None
    }
}

/// Everything persisted for one task, written atomically as a unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub task: Task,
    pub plan: Plan,
    /// One record per plan phase, in plan order.
    pub phases: Vec<PhaseRecord>,
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    #[serde(default)]
    pub retries: Vec<RetryRecord>,
    /// Context waiting to be rendered into its target phase.
    #[serde(default)]
    pub retry_context: Option<RetryContext>,
    #[serde(default)]
    pub gate_decisions: Vec<GateDecision>,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub control: Option<ControlRequest>,
    #[serde(default)]
    pub next_checkpoint_seq: u32,
}

impl TaskState {
    pub fn new(task: Task, plan: Plan) -> Self {
        let phases = plan.ids().map(PhaseRecord::new).collect();
        Self {
            task,
            plan,
            phases,
            checkpoints: Vec::new(),
            retries: Vec::new(),
            retry_context: None,
            gate_decisions: Vec::new(),
            lease: None,
            control: None,
            next_checkpoint_seq: 1,
        }
    }

    pub fn id(&self) -> &str {
        &self.task.id
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().find(|p| p.phase == id)
    }

    /// First phase in plan order that is neither completed nor skipped.
    pub fn next_phase(&self) -> Option<&PhaseSpec> {
        self.plan
            .phases()
            .iter()
            .find(|spec| !self.phase(&spec.id).is_some_and(|r| r.status.is_done()))
    }

    pub fn dependencies_done(&self, spec: &PhaseSpec) -> bool {
        spec.depends_on
            .iter()
            .all(|dep| self.phase(dep).is_some_and(|r| r.status.is_done()))
    }

    /// Checkpoints that have not been superseded by a soft rewind.
    pub fn active_checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter().filter(|c| !c.superseded)
    }

    pub fn checkpoint_for(&self, phase: &str) -> Option<&Checkpoint> {
        self.active_checkpoints().filter(|c| c.phase == phase).last()
    }

    pub fn live_lease(&self, threshold: Duration) -> Option<&Lease> {
        self.lease
            .as_ref()
            .filter(|l| l.dead_reason(threshold).is_none())
    }

    /// Replace the plan, keeping records for phases present in both plans.
    pub fn regenerate(&mut self, plan: Plan) {
        let mut old = std::mem::take(&mut self.phases);
        self.phases = plan
            .ids()
            .map(|id| match old.iter().position(|r| r.phase == id) {
                Some(i) => old.swap_remove(i),
                None => PhaseRecord::new(id),
            })
            .collect();
        self.plan = plan;
    }
}
