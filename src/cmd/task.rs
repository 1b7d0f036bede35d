//! Task lifecycle commands that rewrite state without running the agent.

use anyhow::Result;
use console::style;
use std::path::Path;

use taskforge::task::{Category, NewTask, Weight};

use super::super::Cli;
use super::{open, styled_status};

pub fn cmd_new(
    cli: &Cli,
    project_dir: &Path,
    title: &str,
    weight: Weight,
    category: Category,
    description: &str,
    max_retries: Option<u32>,
) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let mut new = NewTask::new(title, weight)
        .with_description(description)
        .with_category(category);
    if let Some(max) = max_retries {
        new = new.with_max_retries(max);
    }
    let snapshot = supervisor.create_task(new)?;
    let state = &snapshot.state;
    println!(
        "Created {} ({} {}): {}",
        style(&state.task.id).bold(),
        state.task.weight,
        state.task.category,
        state.task.title
    );
    let phases: Vec<&str> = state.plan.ids().collect();
    println!("Plan '{}': {}", state.plan.name, phases.join(" -> "));
    if let Some(ws) = &state.task.workspace {
        println!("Workspace: {} ({})", ws.path.display(), ws.branch);
    }
    Ok(())
}

pub fn cmd_rewind(cli: &Cli, project_dir: &Path, task_id: &str, phase: &str, hard: bool) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let snapshot = supervisor.rewind(task_id, phase, hard)?;
    println!(
        "Rewound {} to the start of '{}' ({}); status {}",
        task_id,
        phase,
        if hard { "hard" } else { "soft" },
        styled_status(snapshot.status())
    );
    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.reset(task_id)?;
    println!("Reset {} to planned.", task_id);
    Ok(())
}

pub fn cmd_resolve(cli: &Cli, project_dir: &Path, task_id: &str, message: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.resolve(task_id, message)?;
    println!("Resolved {}: {}", task_id, message);
    Ok(())
}

pub fn cmd_skip(cli: &Cli, project_dir: &Path, task_id: &str, phase: &str, reason: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let snapshot = supervisor.skip(task_id, phase, reason)?;
    println!(
        "Skipped '{}' of {}; status {}",
        phase,
        task_id,
        styled_status(snapshot.status())
    );
    Ok(())
}

pub fn cmd_fork(cli: &Cli, project_dir: &Path, task_id: &str, phase: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let snapshot = supervisor.fork(task_id, phase)?;
    let task = snapshot.task();
    println!(
        "Forked {} from {} after '{}'",
        style(&task.id).bold(),
        task_id,
        phase
    );
    if let Some(next) = &task.current_phase {
        println!("Next phase: {}. Run `taskforge resume {}` to continue.", next, task.id);
    }
    Ok(())
}

pub fn cmd_replan(cli: &Cli, project_dir: &Path, task_id: &str, weight: Weight) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    let snapshot = supervisor.replan(task_id, weight)?;
    let phases: Vec<&str> = snapshot.state.plan.ids().collect();
    println!(
        "Replanned {} as {}: {}",
        task_id,
        weight,
        phases.join(" -> ")
    );
    Ok(())
}

pub fn cmd_delete(cli: &Cli, project_dir: &Path, task_id: &str) -> Result<()> {
    let supervisor = open(cli, project_dir)?;
    supervisor.delete(task_id)?;
    println!("Deleted {}.", task_id);
    Ok(())
}
