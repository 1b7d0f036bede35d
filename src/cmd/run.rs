//! Foreground execution and control: `taskforge run`, `resume`, `approve`,
//! `reject`, `pause` and `stop`.

use anyhow::Result;
use console::style;
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;

use taskforge::events::TaskEvent;
use taskforge::executor::ExecutionOutcome;
use taskforge::supervisor::Supervisor;

use super::super::Cli;
use super::{open, styled_status};

pub async fn cmd_run(cli: &Cli, project_dir: &Path, task_id: &str, resume: bool) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let events = supervisor.subscribe();
    let snapshot = if resume {
        supervisor.resume(task_id).await?
    } else {
        supervisor.run(task_id).await?
    };
    println!(
        "{} {} ({} phases)",
        style("Running").cyan().bold(),
        task_id,
        snapshot.state.plan.len()
    );
    follow(&supervisor, task_id, events).await
}

pub async fn cmd_approve(
    cli: &Cli,
    project_dir: &Path,
    task_id: &str,
    phase: &str,
    comment: Option<&str>,
) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let events = supervisor.subscribe();
    supervisor.approve(task_id, phase, comment).await?;
    println!("Approved '{}' of {}; continuing.", phase, task_id);
    follow(&supervisor, task_id, events).await
}

pub fn cmd_reject(cli: &Cli, project_dir: &Path, task_id: &str, phase: &str, reason: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.reject(task_id, phase, reason)?;
    println!(
        "Rejected '{}' of {}. The phase will run again on `taskforge resume {}`.",
        phase, task_id, task_id
    );
    Ok(())
}

pub fn cmd_pause(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.pause(task_id)?;
    println!("Pause requested for {}; it stops after the current iteration.", task_id);
    Ok(())
}

pub fn cmd_stop(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.stop(task_id)?;
    println!("Stop requested for {}.", task_id);
    Ok(())
}

fn print_event(event: &TaskEvent) {
    match event {
        TaskEvent::PhaseStatusChanged { phase, to, .. } => {
            println!("  {} {} {}", style("▶").cyan(), style(phase).yellow(), to)
        }
        TaskEvent::CheckpointCreated { phase, seq, commit, .. } => println!(
            "  {} checkpoint #{} for {} at {}",
            style("✓").green(),
            seq,
            phase,
            style(&commit[..commit.len().min(8)]).dim()
        ),
        TaskEvent::RetryScheduled {
            failing_phase,
            target_phase,
            attempt,
            ..
        } => println!(
            "  {} {} failed; retrying from {} (attempt {})",
            style("↺").yellow(),
            failing_phase,
            target_phase,
            attempt
        ),
        TaskEvent::GateDecided { decision, .. } => println!(
            "  gate {} for {}: {:?}",
            decision.policy, decision.phase, decision.outcome
        ),
        TaskEvent::TaskStatusChanged { .. } => {}
    }
}

/// Print this task's events until its executor finishes. The first Ctrl-C
/// requests a stop.
async fn follow(
    supervisor: &Supervisor,
    task_id: &str,
    mut events: tokio::sync::broadcast::Receiver<TaskEvent>,
) -> Result<()> {
    let wait = supervisor.wait(task_id);
    tokio::pin!(wait);
    let mut events_open = true;
    let mut stop_requested = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome?,
            event = events.recv(), if events_open => match event {
                Ok(event) if event.task_id() == task_id => print_event(&event),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => events_open = false,
            },
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                stop_requested = true;
                println!("{}", style("Stopping...").yellow());
                if let Err(e) = supervisor.stop(task_id) {
                    tracing::warn!(task_id, error = %e, "Failed to request stop");
                }
            }
        }
    };

    // Events published just before the worker finished.
    while let Ok(event) = events.try_recv() {
        if event.task_id() == task_id {
            print_event(&event);
        }
    }

    println!();
    println!("{} is {}", task_id, styled_status(outcome.task_status()));
    match outcome {
        ExecutionOutcome::Completed | ExecutionOutcome::Paused => Ok(()),
        ExecutionOutcome::Interrupted => {
            println!("Run `taskforge resume {}` to continue.", task_id);
            Ok(())
        }
        ExecutionOutcome::Blocked { reason } => {
            println!("Blocked: {}", reason);
            println!(
                "Resolve the blocker, then `taskforge resume {}` or `taskforge skip {} <phase>`.",
                task_id, task_id
            );
            Ok(())
        }
        ExecutionOutcome::AwaitingApproval { phase } => {
            println!(
                "'{}' is waiting for review: `taskforge approve {} {}` or `taskforge reject {} {} --reason ...`",
                phase, task_id, phase, task_id, phase
            );
            Ok(())
        }
        ExecutionOutcome::Failed { cause } => {
            anyhow::bail!("{} failed ({}): {}", task_id, cause.kind, cause.message)
        }
    }
}
