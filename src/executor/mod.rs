//! Phase Executor: the per-task control loop.
//!
//! For the task it holds the lease on, the executor repeatedly picks the
//! first unfinished phase of the plan and drives it to an outcome:
//!
//! 1. finished phases are passed over,
//! 2. the artifact inspector may skip the phase,
//! 3. the agent is invoked for up to `max_iterations` bounded iterations,
//!    each scanned for a completion or block sentinel,
//! 4. a completion goes through the phase's gate; approval commits a
//!    checkpoint, rejection rewinds the phase and pauses the task,
//! 5. a block, budget exhaustion, timeout or agent error goes to the retry
//!    controller.
//!
//! Every step is written through the [`StateStore`] under the executor's
//! lease before the loop moves on, so a crash at any point leaves a state
//! the next executor can continue from.

pub mod prompt;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::agent::{AgentRequest, AgentRunner};
use crate::artifacts::{ArtifactInspector, ArtifactStore, output_artifact_name};
use crate::checkpoint::{CheckpointManager, VersionControl};
use crate::errors::{AgentError, EngineError, ErrorKind, FailureCause, Result};
use crate::events::EventBus;
use crate::gates::{self, GateDecision, GateEvaluation};
use crate::plan::PhaseSpec;
use crate::retry::{self, PhaseFailure, RetryDecision, RetryPolicy, truncate_tail};
use crate::settings::Settings;
use crate::signals::{Completion, Sentinel, SentinelScanner};
use crate::state::{ControlRequest, PendingGate, PhaseStatus, StateStore, TaskState};
use crate::task::TaskStatus;

/// Agent output kept per iteration for failure summaries and gate output.
const MAX_ITERATION_OUTPUT: usize = 64 * 1024;

/// The collaborators every executor and supervisor works through.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn StateStore>,
    pub vcs: Arc<dyn VersionControl>,
    pub agent: Arc<dyn AgentRunner>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub events: EventBus,
}

/// Limits and policies applied by the executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub auto_skip: bool,
    pub iteration_timeout: Duration,
    pub phase_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ExecutorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            auto_skip: settings.execution.auto_skip,
            iteration_timeout: settings.iteration_timeout(),
            phase_timeout: settings.phase_timeout(),
            retry: settings.retry_policy(),
        }
    }
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Why [`PhaseExecutor::run`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Paused,
    Interrupted,
    /// Waiting for a human: a block sentinel or an unconfirmed skip.
    Blocked { reason: String },
    /// A human gate is waiting for approve or reject.
    AwaitingApproval { phase: String },
    Failed { cause: FailureCause },
}

impl ExecutionOutcome {
    pub fn task_status(&self) -> TaskStatus {
        match self {
            ExecutionOutcome::Completed => TaskStatus::Completed,
            ExecutionOutcome::Paused => TaskStatus::Paused,
            ExecutionOutcome::Interrupted => TaskStatus::Interrupted,
            ExecutionOutcome::Blocked { .. } | ExecutionOutcome::AwaitingApproval { .. } => {
                TaskStatus::Blocked
            }
            ExecutionOutcome::Failed { .. } => TaskStatus::Failed,
        }
    }
}

/// Result of one attempt at a phase.
enum Attempt {
    Completed { completion: Completion, output: String },
    Failed(PhaseFailure),
    Stopped(ControlRequest),
}

/// How one iteration's stream ended.
enum IterationEnd {
    Sentinel(Sentinel),
    Exhausted,
    Error(AgentError),
    Stopped,
}

/// Drives one task's phases under a lease held by `holder`.
pub struct PhaseExecutor {
    ctx: EngineContext,
    options: ExecutorOptions,
    task_id: String,
    holder: String,
    control: watch::Receiver<Option<ControlRequest>>,
}

impl PhaseExecutor {
    pub fn new(
        ctx: EngineContext,
        options: ExecutorOptions,
        task_id: impl Into<String>,
        holder: impl Into<String>,
        control: watch::Receiver<Option<ControlRequest>>,
    ) -> Self {
        Self {
            ctx,
            options,
            task_id: task_id.into(),
            holder: holder.into(),
            control,
        }
    }

    /// Run phases until the task completes or has to stop.
    ///
    /// The caller must already hold the lease and have moved the task to
    /// `running`. Fatal errors are recorded on the task and returned as
    /// [`ExecutionOutcome::Failed`]; only a lost lease (or a store that can
    /// no longer be written) is returned as `Err`.
    pub async fn run(&mut self) -> Result<ExecutionOutcome> {
        loop {
            let state = self.ctx.store.load(&self.task_id)?;
            if let Some(request) = self.requested_control(&state) {
                return self.stop_at_boundary(request, None);
            }
            let Some(spec) = state.next_phase().cloned() else {
                self.persist(|s| {
                    s.task.transition(TaskStatus::Completed, "complete")?;
                    s.task.current_phase = None;
                    Ok(())
                })?;
                tracing::info!(task_id = %self.task_id, "Task completed");
                return Ok(ExecutionOutcome::Completed);
            };

            match self.step(&state, &spec).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => continue,
                Err(e @ EngineError::LeaseLost { .. }) => return Err(e),
                Err(e) => return self.fail_task(&spec.id, &e),
            }
        }
    }

    async fn step(&self, state: &TaskState, spec: &PhaseSpec) -> Result<Option<ExecutionOutcome>> {
        if !state.dependencies_done(spec) {
            return Err(EngineError::Corrupted {
                task_id: self.task_id.clone(),
                message: format!("phase '{}' is next but its dependencies are unfinished", spec.id),
            });
        }
        let record = state
            .phase(&spec.id)
            .ok_or_else(|| EngineError::PhaseNotFound {
                task_id: self.task_id.clone(),
                phase: spec.id.clone(),
            })?
            .clone();

        if let Some(gate) = &record.pending_gate {
            if gate.approved {
                self.commit_phase(spec, &gate.output, None)?;
                return Ok(None);
            }
            self.persist(|s| {
                s.task.transition(TaskStatus::Blocked, "await approval")?;
                Ok(())
            })?;
            return Ok(Some(ExecutionOutcome::AwaitingApproval {
                phase: spec.id.clone(),
            }));
        }

        let mut declined_skip = false;
        if !record.force_run {
            let decision =
                ArtifactInspector::new(self.ctx.artifacts.as_ref()).can_skip(&self.task_id, spec)?;
            if decision.skippable {
                if self.options.auto_skip {
                    self.persist(|s| {
                        if let Some(r) = s.phase_mut(&spec.id) {
                            r.status = PhaseStatus::Skipped;
                            r.skip_reason = Some(decision.reason.clone());
                            r.skip_suggestion = None;
                            r.completed_at = Some(Utc::now());
                        }
                        Ok(())
                    })?;
                    tracing::info!(task_id = %self.task_id, phase = %spec.id, reason = %decision.reason, "Phase skipped");
                    return Ok(None);
                }
                if record.skip_suggestion.is_none() {
                    let reason = format!(
                        "{}; skip the phase or run again to execute it",
                        decision.reason
                    );
                    self.persist(|s| {
                        if let Some(r) = s.phase_mut(&spec.id) {
                            r.status = PhaseStatus::Blocked;
                            r.skip_suggestion = Some(decision.reason.clone());
                            r.blocked_reason = Some(reason.clone());
                        }
                        s.task.current_phase = Some(spec.id.clone());
                        s.task.transition(TaskStatus::Blocked, "suggest skip")
                    })?;
                    return Ok(Some(ExecutionOutcome::Blocked { reason }));
                }
                // Run again after a suggestion: the caller chose to execute.
                declined_skip = true;
            }
        }

        let start = CheckpointManager::phase_start_commit(state, &spec.id)?;
        CheckpointManager::new(self.ctx.vcs.as_ref()).ensure_at(state, &start)?;

        self.persist(|s| {
            if let Some(r) = s.phase_mut(&spec.id) {
                r.status = PhaseStatus::Running;
                r.started_at.get_or_insert_with(Utc::now);
                // The budget covers one entry into the phase; a resume after a
                // block, stop or failure starts over from the phase start.
                r.iterations = 0;
                r.blocked_reason = None;
                r.error = None;
                r.skip_suggestion = None;
                if declined_skip {
                    r.force_run = true;
                }
            }
            s.task.current_phase = Some(spec.id.clone());
            s.task.transition(TaskStatus::Running, "run phase")
        })?;
        tracing::info!(task_id = %self.task_id, phase = %spec.id, "Phase started");

        match self.attempt(spec).await? {
            Attempt::Completed { completion, output } => {
                self.on_completion(spec, &completion, &output)
            }
            Attempt::Failed(failure) => self.on_failure(spec, failure),
            Attempt::Stopped(request) => self.stop_at_boundary(request, Some(&spec.id)).map(Some),
        }
    }

    /// Iterate the agent on `spec` until a sentinel, a failure, or a stop.
    async fn attempt(&self, spec: &PhaseSpec) -> Result<Attempt> {
        let phase_timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.options.phase_timeout);
        let deadline = Instant::now() + phase_timeout;
        let mut control = self.control.clone();

        loop {
            let state = self.ctx.store.load(&self.task_id)?;
            let record = state.phase(&spec.id).cloned().unwrap_or_default();
            if record.iterations >= spec.max_iterations {
                let err = AgentError::BudgetExhausted {
                    iterations: record.iterations,
                };
                return Ok(Attempt::Failed(PhaseFailure::Retryable {
                    summary: err.to_string(),
                }));
            }
            if let Some(request) = self.requested_control(&state) {
                return Ok(Attempt::Stopped(request));
            }

            let iteration = record.iterations + 1;
            let state = self.persist(|s| {
                if let Some(r) = s.phase_mut(&spec.id) {
                    r.iterations = iteration;
                }
                Ok(())
            })?;
            let artifacts =
                prompt::prior_artifacts(self.ctx.artifacts.as_ref(), &state, &spec.id)?;
            let workspace = state
                .task
                .workspace
                .as_ref()
                .ok_or_else(|| crate::errors::VcsError::WorkspaceMissing {
                    task_id: self.task_id.clone(),
                })?;
            let request = AgentRequest {
                task_id: self.task_id.clone(),
                phase: spec.id.clone(),
                iteration,
                prompt: prompt::render(&state, spec, &artifacts, iteration),
                working_dir: workspace.path.clone(),
                session_id: state.task.session_id.clone(),
            };
            tracing::debug!(task_id = %self.task_id, phase = %spec.id, iteration, "Invoking agent");

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Attempt::Failed(PhaseFailure::Retryable {
                    summary: AgentError::Timeout {
                        after: phase_timeout,
                    }
                    .to_string(),
                }));
            }
            let limit = self.options.iteration_timeout.min(remaining);

            let mut output = String::new();
            let mut session = None;
            let end = tokio::select! {
                result = tokio::time::timeout(limit, self.iterate(request, &mut output, &mut session)) => {
                    match result {
                        Ok(end) => end,
                        Err(_) => {
                            let after = if limit < self.options.iteration_timeout { phase_timeout } else { limit };
                            IterationEnd::Error(AgentError::Timeout { after })
                        }
                    }
                }
                _ = wait_for_stop(&mut control) => IterationEnd::Stopped,
            };

            if let Some(id) = session
                && state.task.session_id.as_deref() != Some(id.as_str())
            {
                self.persist(|s| {
                    s.task.session_id = Some(id.clone());
                    Ok(())
                })?;
            }

            match end {
                IterationEnd::Sentinel(Sentinel::Complete(completion)) => {
                    return Ok(Attempt::Completed { completion, output });
                }
                IterationEnd::Sentinel(Sentinel::Blocked { reason }) => {
                    return Ok(Attempt::Failed(PhaseFailure::Blocked { reason }));
                }
                IterationEnd::Error(err) => {
                    tracing::warn!(task_id = %self.task_id, phase = %spec.id, iteration, error = %err, "Agent iteration failed");
                    let summary = if output.trim().is_empty() {
                        err.to_string()
                    } else {
                        format!("{}\n\n{}", err, output.trim_end())
                    };
                    return Ok(Attempt::Failed(PhaseFailure::Retryable { summary }));
                }
                IterationEnd::Stopped => return Ok(Attempt::Stopped(ControlRequest::Stop)),
                IterationEnd::Exhausted => {
                    tracing::debug!(task_id = %self.task_id, phase = %spec.id, iteration, "No sentinel in iteration");
                }
            }
        }
    }

    /// Consume one agent stream, feeding the sentinel scanner.
    async fn iterate(
        &self,
        request: AgentRequest,
        output: &mut String,
        session: &mut Option<String>,
    ) -> IterationEnd {
        let mut stream = match self.ctx.agent.invoke(request).await {
            Ok(stream) => stream,
            Err(e) => return IterationEnd::Error(e),
        };
        let mut scanner = SentinelScanner::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if chunk.session_id.is_some() {
                        *session = chunk.session_id;
                    }
                    output.push_str(&chunk.text);
                    if output.len() > MAX_ITERATION_OUTPUT {
                        *output = truncate_tail(output, MAX_ITERATION_OUTPUT / 2);
                    }
                    if let Some(sentinel) = scanner.feed(&chunk.text) {
                        return IterationEnd::Sentinel(sentinel);
                    }
                }
                Err(e) => return IterationEnd::Error(e),
            }
        }
        IterationEnd::Exhausted
    }

    fn on_completion(
        &self,
        spec: &PhaseSpec,
        completion: &Completion,
        output: &str,
    ) -> Result<Option<ExecutionOutcome>> {
        let output = if completion.body.trim().is_empty() {
            output.to_string()
        } else {
            completion.body.clone()
        };
        match gates::evaluate(&spec.id, spec.gate, completion) {
            GateEvaluation::Decided(decision) if decision.is_approved() => {
                self.commit_phase(spec, &output, Some(decision))?;
                Ok(None)
            }
            GateEvaluation::Decided(decision) => {
                let reason = decision
                    .comment
                    .clone()
                    .unwrap_or_else(|| "rejected by gate".to_string());
                reject_phase(
                    &self.ctx,
                    &self.task_id,
                    Some(&self.holder),
                    &spec.id,
                    decision,
                    &reason,
                    |_| Ok(()),
                )?;
                Ok(Some(ExecutionOutcome::Paused))
            }
            GateEvaluation::AwaitingHuman => {
                self.persist(|s| {
                    if let Some(r) = s.phase_mut(&spec.id) {
                        r.status = PhaseStatus::Blocked;
                        r.blocked_reason = Some("awaiting human approval".into());
                        r.pending_gate = Some(PendingGate {
                            output: output.clone(),
                            approved: false,
                        });
                    }
                    s.task.transition(TaskStatus::Blocked, "await approval")
                })?;
                tracing::info!(task_id = %self.task_id, phase = %spec.id, "Phase awaiting human approval");
                Ok(Some(ExecutionOutcome::AwaitingApproval {
                    phase: spec.id.clone(),
                }))
            }
        }
    }

    /// Write the phase output, commit a checkpoint, and complete the phase
    /// in one state write.
    fn commit_phase(&self, spec: &PhaseSpec, output: &str, decision: Option<GateDecision>) -> Result<()> {
        if !output.trim().is_empty() {
            self.ctx
                .artifacts
                .write(&self.task_id, &output_artifact_name(&spec.id), output)?;
        }
        let state = self.ctx.store.load(&self.task_id)?;
        let checkpoint = CheckpointManager::new(self.ctx.vcs.as_ref()).commit_phase(&state, &spec.id)?;

        self.persist(|s| {
            if let Some(decision) = &decision {
                s.gate_decisions.push(decision.clone());
            }
            s.next_checkpoint_seq = checkpoint.seq + 1;
            s.checkpoints.push(checkpoint.clone());
            if s
                .retry_context
                .as_ref()
                .is_some_and(|c| c.target_phase == spec.id)
            {
                s.retry_context = None;
            }
            if let Some(r) = s.phase_mut(&spec.id) {
                r.status = PhaseStatus::Completed;
                r.completed_at = Some(Utc::now());
                r.pending_gate = None;
                r.blocked_reason = None;
                r.feedback = None;
                r.force_run = false;
            }
            Ok(())
        })?;
        tracing::info!(task_id = %self.task_id, phase = %spec.id, seq = checkpoint.seq, "Phase completed");
        Ok(())
    }

    fn on_failure(&self, spec: &PhaseSpec, failure: PhaseFailure) -> Result<Option<ExecutionOutcome>> {
        let (status, message) = match &failure {
            PhaseFailure::Blocked { reason } => (PhaseStatus::Blocked, reason.clone()),
            PhaseFailure::Retryable { summary } => (PhaseStatus::Failed, summary.clone()),
        };
        let state = self.persist(|s| {
            if let Some(r) = s.phase_mut(&spec.id) {
                r.status = status;
                match status {
                    PhaseStatus::Blocked => r.blocked_reason = Some(message.clone()),
                    _ => r.error = Some(truncate_tail(&message, retry::MAX_FAILURE_SUMMARY)),
                }
            }
            Ok(())
        })?;

        let mut policy = self.options.retry.clone();
        if let Some(max) = state.task.max_retries {
            policy.max_retries = max;
        }
        let decision = policy.decide(&state.plan, &spec.id, &failure, &state.retries);
        match decision {
            RetryDecision::Escalate { reason } => {
                self.persist(|s| s.task.transition(TaskStatus::Blocked, "block"))?;
                tracing::info!(task_id = %self.task_id, phase = %spec.id, reason = %reason, "Phase blocked");
                Ok(Some(ExecutionOutcome::Blocked { reason }))
            }
            RetryDecision::GiveUp { reason } => {
                let cause = FailureCause::new(ErrorKind::Agent, Some(&spec.id), reason.clone());
                self.persist(|s| {
                    s.task.failure = Some(cause.clone());
                    s.task.transition(TaskStatus::Failed, "fail")
                })?;
                tracing::error!(task_id = %self.task_id, phase = %spec.id, reason = %reason, "Retries exhausted");
                Ok(Some(ExecutionOutcome::Failed { cause }))
            }
            RetryDecision::RetrySame { attempt, context } => {
                self.persist(|s| {
                    retry::record_attempt(&mut s.retries, &context);
                    s.retry_context = Some(context.clone());
                    if let Some(r) = s.phase_mut(&spec.id) {
                        r.reset_to_pending();
                        r.retries += 1;
                        r.force_run = true;
                    }
                    Ok(())
                })?;
                tracing::info!(task_id = %self.task_id, phase = %spec.id, attempt, "Retrying phase");
                Ok(None)
            }
            RetryDecision::Rewind {
                target,
                attempt,
                context,
            } => {
                let mut released = Vec::new();
                let state = self.persist(|s| {
                    retry::record_attempt(&mut s.retries, &context);
                    released = CheckpointManager::truncate(s, &target, true);
                    s.retry_context = Some(context.clone());
                    if let Some(r) = s.phase_mut(&target) {
                        r.retries += 1;
                    }
                    s.task.current_phase = Some(target.clone());
                    Ok(())
                })?;
                let manager = CheckpointManager::new(self.ctx.vcs.as_ref());
                let start = CheckpointManager::phase_start_commit(&state, &target)?;
                manager.restore(&state, &start, true)?;
                manager.release(&released)?;
                tracing::info!(
                    task_id = %self.task_id,
                    failing = %spec.id,
                    target = %target,
                    attempt,
                    "Rewinding for retry"
                );
                Ok(None)
            }
        }
    }

    /// Honour a pause or stop between iterations or phases.
    fn stop_at_boundary(
        &self,
        request: ControlRequest,
        phase: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let (status, outcome) = match request {
            ControlRequest::Pause => (TaskStatus::Paused, ExecutionOutcome::Paused),
            ControlRequest::Stop => (TaskStatus::Interrupted, ExecutionOutcome::Interrupted),
        };
        self.persist(|s| {
            if let Some(phase) = phase
                && let Some(r) = s.phase_mut(phase)
                && r.status == PhaseStatus::Running
            {
                // Iterations are kept; the phase continues where it left off.
                r.status = PhaseStatus::Pending;
            }
            s.control = None;
            s.task.transition(status, "stop")
        })?;
        tracing::info!(task_id = %self.task_id, status = %status, "Execution stopped on request");
        Ok(outcome)
    }

    /// Record a non-retryable error as the task's terminal cause.
    fn fail_task(&self, phase: &str, err: &EngineError) -> Result<ExecutionOutcome> {
        let cause = FailureCause::from_error(err, Some(phase));
        tracing::error!(task_id = %self.task_id, phase, kind = %cause.kind, error = %err, "Task failed");
        self.persist(|s| {
            if let Some(r) = s.phase_mut(phase) {
                r.status = PhaseStatus::Failed;
                r.error = Some(cause.message.clone());
            }
            s.task.failure = Some(cause.clone());
            s.task.transition(TaskStatus::Failed, "fail")
        })?;
        Ok(ExecutionOutcome::Failed { cause })
    }

    fn requested_control(&self, state: &TaskState) -> Option<ControlRequest> {
        let live = *self.control.borrow();
        match (live, state.control) {
            (Some(ControlRequest::Stop), _) | (_, Some(ControlRequest::Stop)) => {
                Some(ControlRequest::Stop)
            }
            (Some(ControlRequest::Pause), _) | (_, Some(ControlRequest::Pause)) => {
                Some(ControlRequest::Pause)
            }
            _ => None,
        }
    }

    fn persist(&self, f: impl FnMut(&mut TaskState) -> Result<()>) -> Result<TaskState> {
        persist_as(&self.ctx, &self.task_id, Some(&self.holder), f)
    }
}

/// Resolves once a stop is requested. Pause requests wait for the
/// iteration boundary and never resolve this.
async fn wait_for_stop(control: &mut watch::Receiver<Option<ControlRequest>>) {
    loop {
        if *control.borrow_and_update() == Some(ControlRequest::Stop) {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Atomic update that publishes the resulting transitions. With a `holder`,
/// the write is refused unless that holder still owns the lease.
pub(crate) fn persist_as(
    ctx: &EngineContext,
    task_id: &str,
    holder: Option<&str>,
    mut f: impl FnMut(&mut TaskState) -> Result<()>,
) -> Result<TaskState> {
    let mut before = None;
    let after = ctx.store.update(task_id, &mut |state| {
        if let Some(holder) = holder
            && state.lease.as_ref().is_none_or(|l| l.holder != holder)
        {
            return Err(EngineError::LeaseLost {
                task_id: state.task.id.clone(),
                holder: holder.to_string(),
            });
        }
        before = Some(state.clone());
        f(state)
    })?;
    if let Some(before) = before {
        ctx.events.publish_diff(&before, &after);
    }
    Ok(after)
}

/// Reject the current attempt at `phase`: record the decision, reset the
/// phase to pending with the reason as feedback, pause the task, and put
/// the working tree back at the phase's start. `check` runs inside the
/// atomic update, before anything is written.
pub(crate) fn reject_phase(
    ctx: &EngineContext,
    task_id: &str,
    holder: Option<&str>,
    phase: &str,
    decision: GateDecision,
    reason: &str,
    check: impl Fn(&mut TaskState) -> Result<()>,
) -> Result<TaskState> {
    let state = persist_as(ctx, task_id, holder, |s| {
        check(s)?;
        s.gate_decisions.push(decision.clone());
        let record = s.phase_mut(phase).ok_or_else(|| EngineError::PhaseNotFound {
            task_id: task_id.to_string(),
            phase: phase.to_string(),
        })?;
        record.reset_to_pending();
        record.force_run = true;
        record.feedback = Some(reason.to_string());
        s.task.current_phase = Some(phase.to_string());
        s.task.transition(TaskStatus::Paused, "reject")
    })?;
    let start = CheckpointManager::phase_start_commit(&state, phase)?;
    CheckpointManager::new(ctx.vcs.as_ref()).restore(&state, &start, true)?;
    tracing::info!(task_id, phase, reason, "Phase rejected");
    Ok(state)
}
