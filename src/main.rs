use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use taskforge::task::{Category, Weight};

mod cmd;

#[derive(Parser)]
#[command(name = "taskforge")]
#[command(version, about = "Drive a coding agent through gated, checkpointed phases")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit diagnostic logs as JSON lines on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Replay agent output from a YAML script instead of invoking the agent
    #[arg(long, global = true, env = "TASKFORGE_REPLAY")]
    pub replay: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize .taskforge/ in the project
    Init,
    /// Create a task and resolve its phase plan
    New {
        title: String,
        #[arg(short, long, default_value = "small")]
        weight: Weight,
        #[arg(short, long, default_value = "feature")]
        category: Category,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Override the retry budget for this task
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Run a task in the foreground until it completes or has to stop
    Run { task_id: String },
    /// Continue a paused, blocked, interrupted or failed task
    Resume { task_id: String },
    /// Pause a running task at the next iteration boundary
    Pause { task_id: String },
    /// Stop a running task immediately
    Stop { task_id: String },
    /// Restore a task to the start of a phase
    Rewind {
        task_id: String,
        phase: String,
        /// Discard later checkpoints and uncommitted changes
        #[arg(long)]
        hard: bool,
    },
    /// Return a task to planned, discarding all progress
    Reset { task_id: String },
    /// Mark a failed task as done without re-running it
    Resolve {
        task_id: String,
        #[arg(short, long)]
        message: String,
    },
    /// Mark a phase as skipped
    Skip {
        task_id: String,
        phase: String,
        #[arg(short, long, default_value = "skipped by user")]
        reason: String,
    },
    /// Approve a phase waiting on a human gate and continue
    Approve {
        task_id: String,
        phase: String,
        #[arg(short, long)]
        comment: Option<String>,
    },
    /// Reject a phase waiting on a human gate
    Reject {
        task_id: String,
        phase: String,
        #[arg(short, long)]
        reason: String,
    },
    /// Start a new task from a phase checkpoint of an existing one
    Fork { task_id: String, phase: String },
    /// Regenerate the phase plan for a new weight
    Replan {
        task_id: String,
        #[arg(short, long)]
        weight: Weight,
    },
    /// Delete a task and its workspace
    Delete { task_id: String },
    /// Show a task's status and phases
    Status {
        task_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List tasks
    List,
    /// List a task's checkpoints
    Checkpoints { task_id: String },
    /// List a task's retry attempts
    Retries { task_id: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default taskforge.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let _log_guard = cmd::init_logging(&cli, &project_dir);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::New {
            title,
            weight,
            category,
            description,
            max_retries,
        } => cmd::cmd_new(
            &cli,
            &project_dir,
            title,
            *weight,
            *category,
            description,
            *max_retries,
        )?,
        Commands::Run { task_id } => cmd::cmd_run(&cli, &project_dir, task_id, false).await?,
        Commands::Resume { task_id } => cmd::cmd_run(&cli, &project_dir, task_id, true).await?,
        Commands::Pause { task_id } => cmd::cmd_pause(&cli, &project_dir, task_id)?,
        Commands::Stop { task_id } => cmd::cmd_stop(&cli, &project_dir, task_id)?,
        Commands::Rewind {
            task_id,
            phase,
            hard,
        } => cmd::cmd_rewind(&cli, &project_dir, task_id, phase, *hard)?,
        Commands::Reset { task_id } => cmd::cmd_reset(&cli, &project_dir, task_id)?,
        Commands::Resolve { task_id, message } => {
            cmd::cmd_resolve(&cli, &project_dir, task_id, message)?
        }
        Commands::Skip {
            task_id,
            phase,
            reason,
        } => cmd::cmd_skip(&cli, &project_dir, task_id, phase, reason)?,
        Commands::Approve {
            task_id,
            phase,
            comment,
        } => cmd::cmd_approve(&cli, &project_dir, task_id, phase, comment.as_deref()).await?,
        Commands::Reject {
            task_id,
            phase,
            reason,
        } => cmd::cmd_reject(&cli, &project_dir, task_id, phase, reason)?,
        Commands::Fork { task_id, phase } => cmd::cmd_fork(&cli, &project_dir, task_id, phase)?,
        Commands::Replan { task_id, weight } => {
            cmd::cmd_replan(&cli, &project_dir, task_id, *weight)?
        }
        Commands::Delete { task_id } => cmd::cmd_delete(&cli, &project_dir, task_id)?,
        Commands::Status { task_id, json } => {
            cmd::cmd_status(&cli, &project_dir, task_id, *json)?
        }
        Commands::List => cmd::cmd_list(&cli, &project_dir)?,
        Commands::Checkpoints { task_id } => cmd::cmd_checkpoints(&cli, &project_dir, task_id)?,
        Commands::Retries { task_id } => cmd::cmd_retries(&cli, &project_dir, task_id)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
