//! Read-only views: `taskforge status`, `list`, `checkpoints`, `retries`.

use anyhow::Result;
use console::style;
use std::path::Path;

use taskforge::state::PhaseStatus;

use super::super::Cli;
use super::{open, styled_status};

fn phase_marker(status: PhaseStatus) -> console::StyledObject<&'static str> {
    match status {
        PhaseStatus::Completed => style("✓").green(),
        PhaseStatus::Skipped => style("-").dim(),
        PhaseStatus::Running => style("▶").cyan(),
        PhaseStatus::Blocked => style("!").yellow(),
        PhaseStatus::Failed => style("✗").red(),
        PhaseStatus::Pending => style("·").dim(),
    }
}

pub fn cmd_status(cli: &Cli, project_dir: &Path, task_id: &str, json: bool) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let snapshot = supervisor.status(task_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.state)?);
        return Ok(());
    }

    let state = &snapshot.state;
    let task = &state.task;
    println!();
    println!("{}: {}", style(&task.id).bold(), task.title);
    println!("Status:   {}", styled_status(snapshot.status()));
    println!("Weight:   {} ({})", task.weight, task.category);
    if let Some(phase) = &task.current_phase {
        println!("Phase:    {}", phase);
    }
    if let Some((source, phase)) = &task.forked_from {
        println!("Forked:   from {} after '{}'", source, phase);
    }
    if let Some(reason) = &snapshot.orphan_reason {
        println!("Orphaned: {}", style(reason).red());
    }
    if let Some(lease) = &state.lease {
        println!("Lease:    {} (heartbeat {})", lease.holder, lease.heartbeat_at.format("%H:%M:%S"));
    }
    if let Some(failure) = &task.failure {
        println!("Failure:  [{}] {}", failure.kind, failure.message);
    }
    if let Some(resolution) = &task.resolution {
        println!("Resolved: {}", resolution.message);
    }

    println!();
    println!("Plan '{}':", state.plan.name);
    for spec in state.plan.phases() {
        let Some(record) = state.phase(&spec.id) else {
            continue;
        };
        let mut line = format!(
            "  {} {:<12} {:<10} gate={:<6} iter {}/{}",
            phase_marker(record.status),
            spec.id,
            record.status.as_str(),
            spec.gate.as_str(),
            record.iterations,
            spec.max_iterations
        );
        if record.retries > 0 {
            line.push_str(&format!(" retries {}", record.retries));
        }
        println!("{}", line);
        if let Some(reason) = record.blocked_reason.as_ref().or(record.skip_suggestion.as_ref()) {
            println!("      {}", style(reason).yellow());
        }
        if let Some(reason) = &record.skip_reason {
            println!("      {}", style(format!("skipped: {}", reason)).dim());
        }
    }
    println!();
    Ok(())
}

pub fn cmd_list(cli: &Cli, project_dir: &Path) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let tasks = supervisor.list()?;
    if tasks.is_empty() {
        println!("No tasks. Run `taskforge new \"<title>\"` to create one.");
        return Ok(());
    }
    println!(
        "{:<10} {:<12} {:<8} {:<12} Title",
        "Task", "Status", "Weight", "Phase"
    );
    println!(
        "{:<10} {:<12} {:<8} {:<12} -----",
        "--------", "----------", "------", "----------"
    );
    for snapshot in &tasks {
        let task = snapshot.task();
        println!(
            "{:<10} {:<12} {:<8} {:<12} {}",
            task.id,
            styled_status(snapshot.status()),
            task.weight.as_str(),
            task.current_phase.as_deref().unwrap_or("-"),
            task.title
        );
    }
    Ok(())
}

pub fn cmd_checkpoints(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let checkpoints = supervisor.checkpoints(task_id)?;
    if checkpoints.is_empty() {
        println!("{} has no checkpoints.", task_id);
        return Ok(());
    }
    for checkpoint in &checkpoints {
        let line = format!(
            "#{:<3} {:<12} {} {} files  {}",
            checkpoint.seq,
            checkpoint.phase,
            &checkpoint.commit[..checkpoint.commit.len().min(10)],
            checkpoint.files_changed.len(),
            checkpoint.created_at.format("%Y-%m-%d %H:%M:%S")
        );
        if checkpoint.superseded {
            println!("{} {}", style(line).dim(), style("(superseded)").dim());
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}

pub fn cmd_retries(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let retries = supervisor.retries(task_id)?;
    if retries.is_empty() {
        println!("{} has no retry attempts.", task_id);
        return Ok(());
    }
    for record in &retries {
        println!(
            "{} -> {}: {} attempt(s), last at {}",
            record.failing_phase,
            record.target_phase,
            record.attempts,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
        println!("    {}", style(&record.last_failure).dim());
    }
    Ok(())
}
