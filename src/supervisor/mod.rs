//! Task Supervisor: execution leases, the worker pool, and every command
//! and query external callers use.
//!
//! `run` takes the task's lease with a compare-and-set in the state store,
//! claims a worker slot, and spawns one [`PhaseExecutor`] plus a heartbeat
//! loop. A lease that is already held, or a full pool, is reported at once;
//! callers never queue. Human gates and blocks are durable states, so a
//! waiting task gives its worker slot back.
//!
//! Commands that rewrite execution state (`rewind`, `reset`, `skip`,
//! `replan`, `resolve`, `approve`, `reject`, `delete`) are refused while a
//! live lease exists on the task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Semaphore, broadcast, watch};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::artifacts::FsArtifactStore;
use crate::checkpoint::{Checkpoint, CheckpointManager, GitVersionControl};
use crate::config::Config;
use crate::errors::{EngineError, ErrorKind, FailureCause, Result};
use crate::events::{EventBus, TaskEvent};
use crate::executor::{
    EngineContext, ExecutionOutcome, ExecutorOptions, PhaseExecutor, persist_as, reject_phase,
};
use crate::gates::{GateDecision, GateOutcome, GatePolicy};
use crate::plan::{DirPlanSource, PlanSource, resolve_plan};
use crate::retry::RetryRecord;
use crate::settings::Settings;
use crate::state::records::get_hostname;
use crate::state::{ControlRequest, FileStateStore, Lease, PhaseRecord, PhaseStatus, TaskState};
use crate::task::{NewTask, Resolution, Task, TaskStatus, Weight};

type RunEnd = std::result::Result<ExecutionOutcome, FailureCause>;

/// Read-only view of a task, with orphan classification applied.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub state: TaskState,
    /// Why a task recorded as `running` has no live executor.
    pub orphan_reason: Option<String>,
}

impl TaskSnapshot {
    /// The status a caller should see: `orphaned` for a dead `running` task.
    pub fn status(&self) -> TaskStatus {
        if self.orphan_reason.is_some() {
            TaskStatus::Orphaned
        } else {
            self.state.task.status
        }
    }

    pub fn task(&self) -> &Task {
        &self.state.task
    }
}

/// Why `state` is orphaned, if it is.
pub fn orphan_reason(state: &TaskState, stale_after: Duration) -> Option<String> {
    match state.task.status {
        TaskStatus::Orphaned => Some(
            state
                .task
                .failure
                .as_ref()
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "executor is gone".to_string()),
        ),
        TaskStatus::Running => match &state.lease {
            None => Some("running without an execution lease".to_string()),
            Some(lease) => lease.dead_reason(stale_after),
        },
        _ => None,
    }
}

fn decider() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "human".to_string())
}

struct RunHandle {
    control: watch::Sender<Option<ControlRequest>>,
    done: watch::Receiver<Option<RunEnd>>,
}

impl RunHandle {
    fn is_active(&self) -> bool {
        self.done.borrow().is_none()
    }
}

struct Inner {
    ctx: EngineContext,
    plans: Arc<dyn PlanSource>,
    settings: Settings,
    options: ExecutorOptions,
    slots: Arc<Semaphore>,
    runs: DashMap<String, RunHandle>,
    holder: String,
}

/// Cloneable handle to the supervisor; clones share leases and workers.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(ctx: EngineContext, plans: Arc<dyn PlanSource>, settings: Settings) -> Self {
        let holder = format!("{}:{}:{}", get_hostname(), std::process::id(), Uuid::new_v4());
        let options = ExecutorOptions::from_settings(&settings);
        let slots = Arc::new(Semaphore::new(settings.execution.max_workers));
        Self {
            inner: Arc::new(Inner {
                ctx,
                plans,
                settings,
                options,
                slots,
                runs: DashMap::new(),
                holder,
            }),
        }
    }

    /// Wire the file store, git workspaces, filesystem artifacts and plan
    /// directory for a project.
    pub fn open(config: &Config, agent: Arc<dyn AgentRunner>) -> Result<Self> {
        config.ensure_directories()?;
        let ctx = EngineContext {
            store: Arc::new(FileStateStore::new(&config.tasks_dir)?),
            vcs: Arc::new(GitVersionControl::new(
                &config.project_dir,
                &config.worktrees_dir,
            )),
            agent,
            artifacts: Arc::new(FsArtifactStore::new(&config.artifacts_dir)),
            events: EventBus::default(),
        };
        let plans = Arc::new(DirPlanSource::new(config.plans_dir()));
        Ok(Self::new(ctx, plans, config.settings.clone()))
    }

    /// Lease holder id: `<hostname>:<pid>:<uuid>`.
    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.ctx.events.subscribe()
    }

    fn stale_after(&self) -> Duration {
        self.inner.settings.stale_after()
    }

    fn snapshot(&self, state: TaskState) -> TaskSnapshot {
        let orphan_reason = orphan_reason(&state, self.stale_after());
        TaskSnapshot {
            state,
            orphan_reason,
        }
    }

    fn persist(&self, task_id: &str, f: impl FnMut(&mut TaskState) -> Result<()>) -> Result<TaskState> {
        persist_as(&self.inner.ctx, task_id, None, f)
    }

    // ---- commands -------------------------------------------------------

    /// Resolve a plan, create the task's workspace, and store it as `planned`.
    pub fn create_task(&self, new: NewTask) -> Result<TaskSnapshot> {
        let template = self.inner.plans.template(new.weight, new.category)?;
        let plan = resolve_plan(&template, &self.inner.settings.plan_options())?;
        let vcs = Arc::clone(&self.inner.ctx.vcs);

        let state = self.inner.ctx.store.create_task(&mut |task_id| {
            let workspace = vcs.create_workspace(&task_id)?;
            let now = Utc::now();
            let task = Task {
                id: task_id,
                title: new.title.clone(),
                description: new.description.clone(),
                weight: new.weight,
                category: new.category,
                status: TaskStatus::Planned,
                current_phase: None,
                workspace: Some(workspace),
                session_id: None,
                max_retries: new.max_retries,
                resolution: None,
                failure: None,
                forked_from: None,
                created_at: now,
                updated_at: now,
            };
            Ok(TaskState::new(task, plan.clone()))
        })?;
        tracing::info!(
            task_id = %state.task.id,
            plan = %state.plan.name,
            phases = state.plan.len(),
            "Task created"
        );
        Ok(self.snapshot(state))
    }

    /// Start executing a task in the background. Fails immediately when the
    /// task is leased elsewhere or no worker slot is free.
    pub async fn run(&self, task_id: &str) -> Result<TaskSnapshot> {
        let permit = Arc::clone(&self.inner.slots)
            .try_acquire_owned()
            .map_err(|_| EngineError::WorkerPoolExhausted {
                limit: self.inner.settings.execution.max_workers,
            })?;

        self.recover_orphan(task_id)?;

        let holder = self.inner.holder.clone();
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            if let Some(lease) = &s.lease
                && (lease.holder == holder || lease.dead_reason(stale_after).is_none())
            {
                return Err(EngineError::AlreadyRunning {
                    task_id: s.task.id.clone(),
                    holder: lease.holder.clone(),
                });
            }
            if !s.task.status.can_run() {
                return Err(EngineError::invalid(&s.task.id, s.task.status, "run"));
            }
            if let Some(old) = &s.lease {
                tracing::warn!(task_id = %s.task.id, previous = %old.holder, "Replacing dead execution lease");
            }
            s.lease = Some(Lease::new(holder.clone()));
            s.control = None;
            s.task.failure = None;
            s.task.transition(TaskStatus::Running, "run")
        })?;
        tracing::info!(task_id, holder = %self.inner.holder, "Lease acquired");

        let (control_tx, control_rx) = watch::channel(None);
        let (done_tx, done_rx) = watch::channel(None);
        self.inner.runs.insert(
            task_id.to_string(),
            RunHandle {
                control: control_tx.clone(),
                done: done_rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        let task_id_owned = task_id.to_string();
        tokio::spawn(async move {
            let heartbeat = tokio::spawn(heartbeat_loop(
                inner.ctx.clone(),
                task_id_owned.clone(),
                inner.holder.clone(),
                inner.settings.heartbeat_interval(),
                control_tx,
            ));

            let mut executor = PhaseExecutor::new(
                inner.ctx.clone(),
                inner.options.clone(),
                task_id_owned.clone(),
                inner.holder.clone(),
                control_rx,
            );
            let result = executor.run().await;
            heartbeat.abort();

            if let Err(e) = inner.ctx.store.release_lease(&task_id_owned, &inner.holder) {
                tracing::warn!(task_id = %task_id_owned, error = %e, "Failed to release lease");
            }
            drop(permit);

            let end = match result {
                Ok(outcome) => {
                    tracing::info!(task_id = %task_id_owned, status = %outcome.task_status(), "Execution finished");
                    Ok(outcome)
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id_owned, error = %e, "Execution aborted");
                    Err(FailureCause::from_error(&e, None))
                }
            };
            let _ = done_tx.send(Some(end));
        });

        Ok(self.snapshot(state))
    }

    /// Wait for the most recent `run` of this task in this process to end.
    /// The finished run is forgotten once its outcome has been returned.
    pub async fn wait(&self, task_id: &str) -> Result<ExecutionOutcome> {
        let mut done = self
            .inner
            .runs
            .get(task_id)
            .map(|run| run.done.clone())
            .ok_or_else(|| {
                EngineError::InvalidRequest(format!(
                    "Task {} was not started by this supervisor",
                    task_id
                ))
            })?;
        loop {
            let end = done.borrow_and_update().clone();
            if let Some(end) = end {
                self.inner.runs.remove_if(task_id, |_, run| !run.is_active());
                return end.map_err(|cause| {
                    EngineError::Other(anyhow::anyhow!("{} ({})", cause.message, cause.kind))
                });
            }
            if done.changed().await.is_err() {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "Worker for task {} exited without reporting",
                    task_id
                )));
            }
        }
    }

    /// `run` followed by `wait`.
    pub async fn run_to_end(&self, task_id: &str) -> Result<ExecutionOutcome> {
        self.run(task_id).await?;
        self.wait(task_id).await
    }

    /// Continue a paused, blocked, interrupted, orphaned or failed task.
    pub async fn resume(&self, task_id: &str) -> Result<TaskSnapshot> {
        let snapshot = self.status(task_id)?;
        if snapshot.status() == TaskStatus::Planned {
            return Err(EngineError::invalid(task_id, TaskStatus::Planned, "resume"));
        }
        self.run(task_id).await
    }

    /// Ask the executor to pause at the next iteration boundary.
    pub fn pause(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.request_control(task_id, ControlRequest::Pause)
    }

    /// Stop the executor now, aborting the agent invocation in flight.
    pub fn stop(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.request_control(task_id, ControlRequest::Stop)
    }

    fn request_control(&self, task_id: &str, request: ControlRequest) -> Result<TaskSnapshot> {
        let action = match request {
            ControlRequest::Pause => "pause",
            ControlRequest::Stop => "stop",
        };
        let snapshot = self.status(task_id)?;
        if snapshot.status() != TaskStatus::Running {
            return Err(EngineError::invalid(task_id, snapshot.status(), action));
        }
        // Durable, so an executor in another process sees it too.
        let state = self.persist(task_id, |s| {
            s.control = Some(request);
            Ok(())
        })?;
        if let Some(run) = self.inner.runs.get(task_id)
            && run.is_active()
        {
            let _ = run.control.send(Some(request));
        }
        tracing::info!(task_id, action, "Control requested");
        Ok(self.snapshot(state))
    }

    /// Restore the task to the start of `phase`. Later phases go back to
    /// `pending`; `hard` discards their checkpoints, otherwise they are kept
    /// as superseded history and a dirty working tree is refused.
    pub fn rewind(&self, task_id: &str, phase: &str, hard: bool) -> Result<TaskSnapshot> {
        let state = self.idle_state(task_id)?;
        if state.plan.position(phase).is_none() {
            return Err(EngineError::PhaseNotFound {
                task_id: task_id.to_string(),
                phase: phase.to_string(),
            });
        }
        let ws = state
            .task
            .workspace
            .clone()
            .ok_or_else(|| crate::errors::VcsError::WorkspaceMissing {
                task_id: task_id.to_string(),
            })?;
        if !hard && self.inner.ctx.vcs.is_dirty(&ws)? {
            return Err(crate::errors::VcsError::DirtyWorkingTree { path: ws.path }.into());
        }

        let mut released = Vec::new();
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            released = CheckpointManager::truncate(s, phase, hard);
            s.task.current_phase = Some(phase.to_string());
            s.task.failure = None;
            s.task.transition(TaskStatus::Paused, "rewind")
        })?;

        let manager = CheckpointManager::new(self.inner.ctx.vcs.as_ref());
        let start = CheckpointManager::phase_start_commit(&state, phase)?;
        manager.restore(&state, &start, hard)?;
        manager.release(&released)?;
        tracing::info!(task_id, phase, hard, released = released.len(), "Task rewound");
        Ok(self.snapshot(state))
    }

    /// Back to `planned`: phase records, checkpoints, retry records and
    /// artifacts are cleared and the workspace returns to its base commit.
    pub fn reset(&self, task_id: &str) -> Result<TaskSnapshot> {
        let before = self.idle_state(task_id)?;
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            s.phases = s.plan.ids().map(PhaseRecord::new).collect();
            s.checkpoints.clear();
            s.retries.clear();
            s.retry_context = None;
            s.control = None;
            s.task.current_phase = None;
            s.task.session_id = None;
            s.task.failure = None;
            s.task.resolution = None;
            s.task.transition(TaskStatus::Planned, "reset")
        })?;
        CheckpointManager::new(self.inner.ctx.vcs.as_ref()).reset_all(&before)?;
        self.inner.ctx.artifacts.clear(task_id)?;
        tracing::info!(task_id, "Task reset");
        Ok(self.snapshot(state))
    }

    /// Accept a failed task as done without re-executing it. The failure
    /// cause is kept.
    pub fn resolve(&self, task_id: &str, message: &str) -> Result<TaskSnapshot> {
        self.idle_state(task_id)?;
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            if s.task.status != TaskStatus::Failed {
                return Err(EngineError::invalid(&s.task.id, s.task.status, "resolve"));
            }
            s.task.resolution = Some(Resolution {
                message: message.to_string(),
                resolved_at: Utc::now(),
            });
            s.task.transition(TaskStatus::Completed, "resolve")
        })?;
        tracing::info!(task_id, "Task resolved");
        Ok(self.snapshot(state))
    }

    /// Mark a phase skipped. Its dependencies must already be finished.
    pub fn skip(&self, task_id: &str, phase: &str, reason: &str) -> Result<TaskSnapshot> {
        self.idle_state(task_id)?;
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            let spec = s.plan.get(phase).cloned().ok_or_else(|| EngineError::PhaseNotFound {
                task_id: s.task.id.clone(),
                phase: phase.to_string(),
            })?;
            if !s.dependencies_done(&spec) {
                return Err(EngineError::InvalidRequest(format!(
                    "Cannot skip '{}' before its dependencies ({}) are finished",
                    phase,
                    spec.depends_on.join(", ")
                )));
            }
            let blocked_here = s.task.status == TaskStatus::Blocked
                && s.task.current_phase.as_deref() == Some(phase);
            let record = s.phase_mut(phase).ok_or_else(|| EngineError::PhaseNotFound {
                task_id: task_id.to_string(),
                phase: phase.to_string(),
            })?;
            if record.status.is_done() {
                return Err(EngineError::InvalidRequest(format!(
                    "Phase '{}' is already {}",
                    phase, record.status
                )));
            }
            record.status = PhaseStatus::Skipped;
            record.skip_reason = Some(reason.to_string());
            record.skip_suggestion = None;
            record.blocked_reason = None;
            record.pending_gate = None;
            record.completed_at = Some(Utc::now());
            if blocked_here {
                s.task.transition(TaskStatus::Paused, "skip")?;
            }
            Ok(())
        })?;
        tracing::info!(task_id, phase, reason, "Phase skipped on request");
        Ok(self.snapshot(state))
    }

    /// Approve a phase waiting on a human gate and continue execution.
    pub async fn approve(
        &self,
        task_id: &str,
        phase: &str,
        comment: Option<&str>,
    ) -> Result<TaskSnapshot> {
        self.idle_state(task_id)?;
        let decision = GateDecision::new(
            phase,
            GatePolicy::Human,
            GateOutcome::Approve,
            decider(),
            comment.map(str::to_string),
        );
        let stale_after = self.stale_after();
        self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            let task_id = s.task.id.clone();
            let gate = awaiting_gate(s, phase, &task_id)?;
            gate.approved = true;
            s.gate_decisions.push(decision.clone());
            Ok(())
        })?;
        tracing::info!(task_id, phase, "Phase approved");
        self.run(task_id).await
    }

    /// Reject a phase waiting on a human gate: the phase goes back to its
    /// start with `reason` as feedback and the task is paused.
    pub fn reject(&self, task_id: &str, phase: &str, reason: &str) -> Result<TaskSnapshot> {
        let mut state = self.idle_state(task_id)?;
        awaiting_gate(&mut state, phase, task_id)?;
        let decision = GateDecision::new(
            phase,
            GatePolicy::Human,
            GateOutcome::Reject,
            decider(),
            Some(reason.to_string()),
        );
        let stale_after = self.stale_after();
        let state = reject_phase(&self.inner.ctx, task_id, None, phase, decision, reason, |s| {
            ensure_unleased(s, stale_after)?;
            let task_id = s.task.id.clone();
            awaiting_gate(s, phase, &task_id).map(|_| ())
        })?;
        Ok(self.snapshot(state))
    }

    /// Start a new task from the checkpoint of `phase`. The source task is
    /// only read.
    pub fn fork(&self, task_id: &str, phase: &str) -> Result<TaskSnapshot> {
        let source = self.inner.ctx.store.load(task_id)?;
        if source.plan.position(phase).is_none() {
            return Err(EngineError::PhaseNotFound {
                task_id: task_id.to_string(),
                phase: phase.to_string(),
            });
        }
        let vcs = Arc::clone(&self.inner.ctx.vcs);
        let state = self.inner.ctx.store.create_task(&mut |new_id| {
            let manager = CheckpointManager::new(vcs.as_ref());
            let (workspace, _) = manager.fork(&source, phase, &new_id)?;
            let now = Utc::now();
            let task = Task {
                id: new_id.clone(),
                status: TaskStatus::Paused,
                current_phase: None,
                workspace: Some(workspace),
                session_id: None,
                resolution: None,
                failure: None,
                forked_from: Some((source.task.id.clone(), phase.to_string())),
                created_at: now,
                updated_at: now,
                ..source.task.clone()
            };
            let mut fork = TaskState::new(task, source.plan.clone());
            let pins = CheckpointManager::seed_fork(&mut fork, &source, phase);
            manager.pin_fork(&new_id, &pins)?;
            fork.task.current_phase = fork.next_phase().map(|p| p.id.clone());
            Ok(fork)
        })?;
        tracing::info!(source = task_id, task_id = %state.task.id, phase, "Task forked");
        Ok(self.snapshot(state))
    }

    /// Regenerate the plan for a new weight, keeping records of phases the
    /// old and new plans share.
    pub fn replan(&self, task_id: &str, weight: Weight) -> Result<TaskSnapshot> {
        let current = self.idle_state(task_id)?;
        let template = self.inner.plans.template(weight, current.task.category)?;
        let plan = resolve_plan(&template, &self.inner.settings.plan_options())?;
        let stale_after = self.stale_after();
        let state = self.persist(task_id, |s| {
            ensure_unleased(s, stale_after)?;
            s.task.weight = weight;
            s.regenerate(plan.clone());
            let ids: Vec<String> = s.plan.ids().map(str::to_string).collect();
            s.checkpoints.retain(|c| ids.contains(&c.phase));
            if s
                .retry_context
                .as_ref()
                .is_some_and(|c| !ids.contains(&c.target_phase))
            {
                s.retry_context = None;
            }
            Ok(())
        })?;
        tracing::info!(task_id, weight = %weight, plan = %state.plan.name, "Task replanned");
        Ok(self.snapshot(state))
    }

    /// Remove a task, its workspace, pins and artifacts.
    pub fn delete(&self, task_id: &str) -> Result<()> {
        let state = self.idle_state(task_id)?;
        self.inner.ctx.store.delete(task_id, self.stale_after())?;
        self.inner.runs.remove(task_id);

        let manager = CheckpointManager::new(self.inner.ctx.vcs.as_ref());
        if let Err(e) = manager.release(&CheckpointManager::pins(&state)) {
            tracing::warn!(task_id, error = %e, "Failed to release checkpoint pins");
        }
        if let Some(ws) = &state.task.workspace
            && let Err(e) = self.inner.ctx.vcs.remove_workspace(ws)
        {
            tracing::warn!(task_id, error = %e, "Failed to remove workspace");
        }
        if let Err(e) = self.inner.ctx.artifacts.clear(task_id) {
            tracing::warn!(task_id, error = %e, "Failed to remove artifacts");
        }
        tracing::info!(task_id, "Task deleted");
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    /// Snapshot of a task. A `running` task whose executor is gone is
    /// reported as orphaned; nothing is written.
    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot> {
        let state = self.inner.ctx.store.load(task_id)?;
        Ok(self.snapshot(state))
    }

    pub fn list(&self) -> Result<Vec<TaskSnapshot>> {
        Ok(self
            .inner
            .ctx
            .store
            .list()?
            .into_iter()
            .map(|s| self.snapshot(s))
            .collect())
    }

    pub fn phases(&self, task_id: &str) -> Result<Vec<PhaseRecord>> {
        Ok(self.inner.ctx.store.load(task_id)?.phases)
    }

    pub fn checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        Ok(self.inner.ctx.store.load(task_id)?.checkpoints)
    }

    pub fn retries(&self, task_id: &str) -> Result<Vec<RetryRecord>> {
        Ok(self.inner.ctx.store.load(task_id)?.retries)
    }

    pub fn gate_decisions(&self, task_id: &str) -> Result<Vec<GateDecision>> {
        Ok(self.inner.ctx.store.load(task_id)?.gate_decisions)
    }

    // ---- helpers --------------------------------------------------------

    /// Load a task that no executor owns, first turning an orphaned
    /// execution into `interrupted`.
    fn idle_state(&self, task_id: &str) -> Result<TaskState> {
        self.recover_orphan(task_id)?;
        let state = self.inner.ctx.store.load(task_id)?;
        ensure_unleased(&state, self.stale_after())?;
        if state.task.status == TaskStatus::Running {
            return Err(EngineError::invalid(task_id, TaskStatus::Running, "modify"));
        }
        Ok(state)
    }

    /// Persist `interrupted` for a task whose executor died, dropping the
    /// stale lease. No-op for anything else.
    fn recover_orphan(&self, task_id: &str) -> Result<()> {
        let stale_after = self.stale_after();
        let state = self.inner.ctx.store.load(task_id)?;
        if orphan_reason(&state, stale_after).is_none() {
            return Ok(());
        }
        let mut reason = None;
        self.persist(task_id, |s| {
            // Re-check under the lock: the holder may have heartbeated since.
            let Some(why) = orphan_reason(s, stale_after) else {
                return Ok(());
            };
            if let Some(lease) = s.lease.take() {
                tracing::warn!(task_id = %s.task.id, holder = %lease.holder, reason = %why, "Releasing orphaned lease");
            }
            let phase = s.task.current_phase.clone();
            if let Some(phase) = &phase
                && let Some(r) = s.phase_mut(phase)
                && r.status == PhaseStatus::Running
            {
                r.status = PhaseStatus::Pending;
            }
            s.task.failure = Some(FailureCause::new(
                ErrorKind::State,
                phase.as_deref(),
                format!("orphaned: {}", why),
            ));
            s.control = None;
            s.task.transition(TaskStatus::Interrupted, "recover")?;
            reason = Some(why);
            Ok(())
        })?;
        if let Some(reason) = reason {
            tracing::warn!(task_id, reason = %reason, "Recovered orphaned task as interrupted");
        }
        Ok(())
    }
}

fn ensure_unleased(state: &TaskState, stale_after: Duration) -> Result<()> {
    match state.live_lease(stale_after) {
        Some(lease) => Err(EngineError::AlreadyRunning {
            task_id: state.task.id.clone(),
            holder: lease.holder.clone(),
        }),
        None => Ok(()),
    }
}

fn awaiting_gate<'a>(
    state: &'a mut TaskState,
    phase: &str,
    task_id: &str,
) -> Result<&'a mut crate::state::PendingGate> {
    let record = state
        .phase_mut(phase)
        .ok_or_else(|| EngineError::PhaseNotFound {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
        })?;
    match record.pending_gate.as_mut() {
        Some(gate) if !gate.approved => Ok(gate),
        _ => Err(EngineError::InvalidRequest(format!(
            "Phase '{}' of {} is not awaiting approval",
            phase, task_id
        ))),
    }
}

/// Refresh the lease until aborted. Losing the lease, or a durable stop
/// request from another process, stops the executor.
async fn heartbeat_loop(
    ctx: EngineContext,
    task_id: String,
    holder: String,
    interval: Duration,
    control: watch::Sender<Option<ControlRequest>>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match ctx.store.heartbeat(&task_id, &holder) {
            Ok(()) => tracing::debug!(task_id = %task_id, "Heartbeat"),
            Err(e @ EngineError::LeaseLost { .. }) => {
                tracing::warn!(task_id = %task_id, error = %e, "Lease lost; stopping executor");
                let _ = control.send(Some(ControlRequest::Stop));
                return;
            }
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Heartbeat failed"),
        }
        if let Ok(state) = ctx.store.load(&task_id)
            && state.control == Some(ControlRequest::Stop)
        {
            let _ = control.send(Some(ControlRequest::Stop));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{ScriptStep, ScriptedAgent};
    use crate::artifacts::FsArtifactStore;
    use crate::plan::BuiltinPlans;
    use crate::state::MemoryStateStore;
    use git2::{Repository, Signature};
    use std::collections::HashMap;
    use std::path::Path;
    use tempfile::{TempDir, tempdir};

    const DONE: &str = "work finished <phase_complete>summary of the phase</phase_complete>";

    fn init_repo_with_commit(path: &Path) {
        let repo = Repository::init(path).unwrap();
        std::fs::write(path.join("README.md"), "# project\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
    }

    fn supervisor_with(agent: ScriptedAgent, settings: Settings) -> (Supervisor, TempDir) {
        let dir = tempdir().unwrap();
        init_repo_with_commit(dir.path());
        let ctx = EngineContext {
            store: Arc::new(MemoryStateStore::new()),
            vcs: Arc::new(GitVersionControl::new(
                dir.path(),
                dir.path().join(".taskforge/worktrees"),
            )),
            agent: Arc::new(agent),
            artifacts: Arc::new(FsArtifactStore::new(dir.path().join(".taskforge/artifacts"))),
            events: EventBus::default(),
        };
        (Supervisor::new(ctx, Arc::new(BuiltinPlans), settings), dir)
    }

    fn agent(steps: Vec<ScriptStep>) -> ScriptedAgent {
        ScriptedAgent::new(HashMap::from([("*".to_string(), steps)]))
    }

    fn slow() -> ScriptStep {
        ScriptStep::Detailed {
            output: DONE.into(),
            exit_code: None,
            delay_ms: 2_000,
        }
    }

    fn trivial(sup: &Supervisor) -> String {
        sup.create_task(NewTask::new("Fix typo", Weight::Trivial))
            .unwrap()
            .task()
            .id
            .clone()
    }

    #[tokio::test]
    async fn test_run_to_completion_releases_lease() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        assert_eq!(sup.status(&id).unwrap().status(), TaskStatus::Planned);

        let outcome = sup.run_to_end(&id).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed);

        let snapshot = sup.status(&id).unwrap();
        assert_eq!(snapshot.status(), TaskStatus::Completed);
        assert!(snapshot.state.lease.is_none());
        assert_eq!(sup.checkpoints(&id).unwrap().len(), 2);
        assert!(
            sup.phases(&id)
                .unwrap()
                .iter()
                .all(|p| p.status == PhaseStatus::Completed)
        );
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_leased() {
        let (sup, _dir) = supervisor_with(agent(vec![slow()]), Settings::default());
        let id = trivial(&sup);
        sup.run(&id).await.unwrap();

        let err = sup.run(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));
        let err = sup.rewind(&id, "tiny_spec", true).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        sup.stop(&id).unwrap();
        assert_eq!(sup.wait(&id).await.unwrap(), ExecutionOutcome::Interrupted);
        assert_eq!(sup.status(&id).unwrap().status(), TaskStatus::Interrupted);
    }

    #[tokio::test]
    async fn test_worker_pool_exhaustion_fails_fast() {
        let mut settings = Settings::default();
        settings.execution.max_workers = 1;
        let (sup, _dir) = supervisor_with(agent(vec![slow()]), settings);
        let first = trivial(&sup);
        let second = trivial(&sup);

        sup.run(&first).await.unwrap();
        let err = sup.run(&second).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerPoolExhausted { limit: 1 }));
        assert_eq!(sup.status(&second).unwrap().status(), TaskStatus::Planned);
        sup.stop(&first).unwrap();
        sup.wait(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_orphan_is_reported_then_recovered() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        sup.persist(&id, |s| {
            s.task.status = TaskStatus::Running;
            s.lease = Some(Lease {
                pid: 999_999_999,
                ..Lease::new("crashed-host-process")
            });
            Ok(())
        })
        .unwrap();

        let snapshot = sup.status(&id).unwrap();
        assert_eq!(snapshot.status(), TaskStatus::Orphaned);
        assert_eq!(snapshot.state.task.status, TaskStatus::Running);

        assert_eq!(sup.run_to_end(&id).await.unwrap(), ExecutionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_human_gate_approve_and_reject() {
        let mut settings = Settings::default();
        settings.gates.insert("implement".into(), GatePolicy::Human);
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), settings);
        let id = trivial(&sup);

        let outcome = sup.run_to_end(&id).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::AwaitingApproval {
                phase: "implement".into()
            }
        );
        assert!(sup.approve(&id, "tiny_spec", None).await.is_err());

        let state = sup.reject(&id, "implement", "needs tests").unwrap().state;
        assert_eq!(state.task.status, TaskStatus::Paused);
        let record = state.phase("implement").unwrap();
        assert_eq!(record.status, PhaseStatus::Pending);
        assert_eq!(record.feedback.as_deref(), Some("needs tests"));

        assert_eq!(
            sup.run_to_end(&id).await.unwrap(),
            ExecutionOutcome::AwaitingApproval {
                phase: "implement".into()
            }
        );
        sup.approve(&id, "implement", Some("lgtm")).await.unwrap();
        assert_eq!(sup.wait(&id).await.unwrap(), ExecutionOutcome::Completed);

        let decisions = sup.gate_decisions(&id).unwrap();
        let human: Vec<_> = decisions
            .iter()
            .filter(|d| d.policy == GatePolicy::Human)
            .map(|d| d.outcome)
            .collect();
        assert_eq!(human, [GateOutcome::Reject, GateOutcome::Approve]);
    }

    #[tokio::test]
    async fn test_reject_refused_while_leased_elsewhere() {
        let mut settings = Settings::default();
        settings.gates.insert("implement".into(), GatePolicy::Human);
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), settings);
        let id = trivial(&sup);
        sup.run_to_end(&id).await.unwrap();

        sup.persist(&id, |s| {
            s.lease = Some(Lease::new("other-host:1:abc"));
            Ok(())
        })
        .unwrap();
        let err = sup.reject(&id, "implement", "needs tests").unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        let state = sup.status(&id).unwrap().state;
        assert_eq!(state.task.status, TaskStatus::Blocked);
        assert!(state.phase("implement").unwrap().pending_gate.is_some());
        assert!(
            state
                .gate_decisions
                .iter()
                .all(|d| d.policy != GatePolicy::Human)
        );
    }

    #[tokio::test]
    async fn test_finished_runs_are_forgotten() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let first = trivial(&sup);
        let second = trivial(&sup);

        sup.run_to_end(&first).await.unwrap();
        assert!(!sup.inner.runs.contains_key(&first));
        assert!(sup.wait(&first).await.is_err());

        sup.run(&second).await.unwrap();
        assert!(sup.inner.runs.contains_key(&second));
        while sup.status(&second).unwrap().state.lease.is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sup.delete(&second).unwrap();
        assert!(sup.inner.runs.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_requires_failed_task() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        assert!(matches!(
            sup.resolve(&id, "fixed by hand").unwrap_err(),
            EngineError::InvalidTransition { .. }
        ));

        sup.persist(&id, |s| {
            s.task.failure = Some(FailureCause::new(ErrorKind::Agent, None, "boom"));
            s.task.status = TaskStatus::Failed;
            Ok(())
        })
        .unwrap();
        let state = sup.resolve(&id, "fixed by hand").unwrap().state;
        assert_eq!(state.task.status, TaskStatus::Completed);
        assert!(state.task.failure.is_some());
        assert_eq!(state.task.resolution.unwrap().message, "fixed by hand");
    }

    #[tokio::test]
    async fn test_skip_checks_dependencies() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        assert!(matches!(
            sup.skip(&id, "implement", "nothing to do").unwrap_err(),
            EngineError::InvalidRequest(_)
        ));
        sup.skip(&id, "tiny_spec", "obvious").unwrap();
        assert!(sup.skip(&id, "tiny_spec", "again").is_err());

        assert_eq!(sup.run_to_end(&id).await.unwrap(), ExecutionOutcome::Completed);
        let phases = sup.phases(&id).unwrap();
        assert_eq!(phases[0].status, PhaseStatus::Skipped);
        assert_eq!(phases[1].status, PhaseStatus::Completed);
    }

    #[tokio::test]
    async fn test_fork_starts_paused_after_source_phase() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        sup.run_to_end(&id).await.unwrap();

        let fork = sup.fork(&id, "tiny_spec").unwrap().state;
        assert_ne!(fork.task.id, id);
        assert_eq!(fork.task.status, TaskStatus::Paused);
        assert_eq!(fork.task.current_phase.as_deref(), Some("implement"));
        assert_eq!(fork.task.forked_from, Some((id.clone(), "tiny_spec".into())));
        assert_eq!(fork.checkpoints.len(), 1);

        let source = sup.status(&id).unwrap().state;
        assert_eq!(source.task.status, TaskStatus::Completed);
        assert_eq!(source.checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_returns_to_planned() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        sup.run_to_end(&id).await.unwrap();

        let state = sup.reset(&id).unwrap().state;
        assert_eq!(state.task.status, TaskStatus::Planned);
        assert!(state.checkpoints.is_empty());
        assert!(state.phases.iter().all(|p| p.status == PhaseStatus::Pending));
        assert!(state.next_checkpoint_seq > 2);
    }

    #[tokio::test]
    async fn test_resume_refuses_planned_task() {
        let (sup, _dir) = supervisor_with(agent(vec![ScriptStep::Say(DONE.into())]), Settings::default());
        let id = trivial(&sup);
        assert!(matches!(
            sup.resume(&id).await.unwrap_err(),
            EngineError::InvalidTransition { .. }
        ));
        assert!(sup.pause(&id).is_err());
    }
}
