//! Task and phase transition events for real-time observers.
//!
//! Events are derived by diffing the state before and after a durable
//! write, then broadcast. Delivery is at-least-once: observers may see the
//! same transition twice and must treat events as idempotent.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::gates::GateDecision;
use crate::state::{PhaseStatus, TaskState};
use crate::task::TaskStatus;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStatusChanged {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
    PhaseStatusChanged {
        task_id: String,
        phase: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },
    CheckpointCreated {
        task_id: String,
        phase: String,
        seq: u32,
        commit: String,
    },
    RetryScheduled {
        task_id: String,
        failing_phase: String,
        target_phase: String,
        attempt: u32,
    },
    GateDecided {
        task_id: String,
        decision: GateDecision,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::TaskStatusChanged { task_id, .. }
            | TaskEvent::PhaseStatusChanged { task_id, .. }
            | TaskEvent::CheckpointCreated { task_id, .. }
            | TaskEvent::RetryScheduled { task_id, .. }
            | TaskEvent::GateDecided { task_id, .. } => task_id,
        }
    }
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskEvent::TaskStatusChanged { task_id, from, to } => {
                write!(f, "{} {} -> {}", task_id, from, to)
            }
            TaskEvent::PhaseStatusChanged {
                task_id,
                phase,
                from,
                to,
            } => write!(f, "{} [{}] {} -> {}", task_id, phase, from, to),
            TaskEvent::CheckpointCreated {
                task_id,
                phase,
                seq,
                commit,
            } => {
                let short = commit.get(..8).unwrap_or(commit);
                write!(f, "{} [{}] checkpoint #{} {}", task_id, phase, seq, short)
            }
            TaskEvent::RetryScheduled {
                task_id,
                failing_phase,
                target_phase,
                attempt,
            } => write!(
                f,
                "{} retry {} -> {} (attempt {})",
                task_id, failing_phase, target_phase, attempt
            ),
            TaskEvent::GateDecided { task_id, decision } => write!(
                f,
                "{} [{}] gate {} by {}",
                task_id,
                decision.phase,
                if decision.is_approved() { "approved" } else { "rejected" },
                decision.decider
            ),
        }
    }
}

/// Every observable transition between two snapshots of the same task.
pub fn diff(before: &TaskState, after: &TaskState) -> Vec<TaskEvent> {
    let task_id = after.task.id.clone();
    let mut events = Vec::new();

    for record in &after.phases {
        let from = before
            .phase(&record.phase)
            .map_or(PhaseStatus::Pending, |r| r.status);
        if from != record.status {
            events.push(TaskEvent::PhaseStatusChanged {
                task_id: task_id.clone(),
                phase: record.phase.clone(),
                from,
                to: record.status,
            });
        }
    }

    for checkpoint in &after.checkpoints {
        let known = before
            .checkpoints
            .iter()
            .any(|c| c.seq == checkpoint.seq && c.commit == checkpoint.commit);
        if !known {
            events.push(TaskEvent::CheckpointCreated {
                task_id: task_id.clone(),
                phase: checkpoint.phase.clone(),
                seq: checkpoint.seq,
                commit: checkpoint.commit.clone(),
            });
        }
    }

    for record in &after.retries {
        let previous = crate::retry::find_record(
            &before.retries,
            &record.failing_phase,
            &record.target_phase,
        )
        .map_or(0, |r| r.attempts);
        if record.attempts > previous {
            events.push(TaskEvent::RetryScheduled {
                task_id: task_id.clone(),
                failing_phase: record.failing_phase.clone(),
                target_phase: record.target_phase.clone(),
                attempt: record.attempts,
            });
        }
    }

    // Gate decisions are append-only, so anything past the old length is new.
    if after.gate_decisions.len() > before.gate_decisions.len() {
        for decision in &after.gate_decisions[before.gate_decisions.len()..] {
            events.push(TaskEvent::GateDecided {
                task_id: task_id.clone(),
                decision: decision.clone(),
            });
        }
    }

    if before.task.status != after.task.status {
        events.push(TaskEvent::TaskStatusChanged {
            task_id,
            from: before.task.status,
            to: after.task.status,
        });
    }
    events
}

/// Broadcast fan-out of [`TaskEvent`]s. Slow subscribers lag and miss
/// events rather than blocking the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TaskEvent) {
        tracing::debug!(task_id = %event.task_id(), event = %event, "Publishing event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Publish every transition between `before` and `after`. Call only once
    /// `after` is durable.
    pub fn publish_diff(&self, before: &TaskState, after: &TaskState) {
        for event in diff(before, after) {
            self.publish(event);
        }
    }
}
