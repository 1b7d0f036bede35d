//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                                              |
//! |-----------|---------------------------------------------------------------|
//! | `project` | `Init`                                                        |
//! | `task`    | `New`, `Rewind`, `Reset`, `Resolve`, `Skip`, `Fork`, `Replan`, `Delete` |
//! | `run`     | `Run`, `Resume`, `Approve`, `Reject`, `Pause`, `Stop`         |
//! | `query`   | `Status`, `List`, `Checkpoints`, `Retries`                    |
//! | `config`  | `Config`                                                      |

pub mod config;
pub mod project;
pub mod query;
pub mod run;
pub mod task;

pub use config::cmd_config;
pub use project::cmd_init;
pub use query::{cmd_checkpoints, cmd_list, cmd_retries, cmd_status};
pub use run::{cmd_approve, cmd_pause, cmd_reject, cmd_run, cmd_stop};
pub use task::{cmd_delete, cmd_fork, cmd_new, cmd_replan, cmd_reset, cmd_resolve, cmd_rewind, cmd_skip};

use anyhow::Result;
use console::{StyledObject, style};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

use taskforge::agent::{AgentRunner, ClaudeRunner, ScriptedAgent};
use taskforge::config::Config;
use taskforge::supervisor::Supervisor;
use taskforge::task::TaskStatus;

use super::Cli;

/// Logs go to a file only for initialized projects with `[logging] file`.
pub fn init_logging(cli: &Cli, project_dir: &Path) -> Option<WorkerGuard> {
    let log_dir = Config::new(project_dir)
        .ok()
        .filter(|c| c.settings.logging.file && c.is_initialized())
        .map(|c| c.log_dir);
    taskforge::logging::init(cli.verbose, cli.json_logs, log_dir.as_deref())
}

pub(crate) fn load_config(project_dir: &Path) -> Result<Config> {
    let config = Config::new(project_dir)?;
    if !config.is_initialized() {
        anyhow::bail!(
            "Project not initialized. Run 'taskforge init' in {} first.",
            config.project_dir.display()
        );
    }
    Ok(config)
}

/// Load the project and wire a supervisor with the configured agent, or
/// the replay script when `--replay` is given.
pub(crate) fn open(cli: &Cli, project_dir: &Path) -> Result<Supervisor> {
    let config = load_config(project_dir)?;
    let agent: Arc<dyn AgentRunner> = match &cli.replay {
        Some(path) => Arc::new(ScriptedAgent::load(path)?),
        None => Arc::new(ClaudeRunner::new(
            config.settings.agent.command.clone(),
            config.settings.agent.args.clone(),
        )),
    };
    Ok(Supervisor::open(&config, agent)?)
}

pub(crate) fn styled_status(status: TaskStatus) -> StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        TaskStatus::Completed => s.green(),
        TaskStatus::Running => s.cyan(),
        TaskStatus::Failed | TaskStatus::Orphaned => s.red(),
        TaskStatus::Blocked | TaskStatus::Interrupted => s.yellow(),
        TaskStatus::Planned | TaskStatus::Paused => s.dim(),
    }
}
