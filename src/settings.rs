//! Project settings read from `.taskforge/taskforge.toml`.
//!
//! Every field has a default, so a missing file, an empty file and a partial
//! file are all valid.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agent]
//! command = "claude"
//! args = ["--print", "--output-format", "stream-json", "--verbose"]
//! iteration_timeout_secs = 1800
//! phase_timeout_secs = 7200
//! max_iterations = 20
//!
//! [execution]
//! max_workers = 4
//! auto_skip = true
//!
//! [retry]
//! max_retries = 2
//!
//! [retry.map]
//! test = "implement"
//! review = "implement"
//!
//! [lease]
//! heartbeat_interval_secs = 30
//! stale_after_secs = 300
//!
//! [plans]
//! dir = "plans"
//!
//! [gates]
//! review = "human"
//!
//! [logging]
//! file = false
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gates::GatePolicy;
use crate::plan::{DEFAULT_MAX_ITERATIONS, PlanOptions};
use crate::retry::{DEFAULT_MAX_RETRIES, RetryPolicy, default_retry_map};

pub const SETTINGS_FILE: &str = "taskforge.toml";

/// How the agent process is launched and bounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
    /// Wall-clock limit for one agent iteration.
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
    /// Wall-clock limit for all iterations of one phase attempt.
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,
    /// Iteration budget for phases whose template does not set one.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
            iteration_timeout_secs: default_iteration_timeout(),
            phase_timeout_secs: default_phase_timeout(),
            max_iterations: default_max_iterations(),
        }
    }
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    ["--print", "--output-format", "stream-json", "--verbose"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_iteration_timeout() -> u64 {
    30 * 60
}

fn default_phase_timeout() -> u64 {
    2 * 60 * 60
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Tasks that may execute at the same time in one process.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Skip phases whose artifacts already exist without asking.
    #[serde(default = "default_auto_skip")]
    pub auto_skip: bool,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            auto_skip: default_auto_skip(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_auto_skip() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Failing phase -> phase to rewind to.
    #[serde(default = "default_retry_map")]
    pub map: HashMap<String, String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            map: default_retry_map(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseSection {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// A running task whose heartbeat is older than this is orphaned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

impl Default for LeaseSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            stale_after_secs: default_stale_after(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    5 * 60
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlansSection {
    /// Directory of plan templates, relative to `.taskforge/`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Also write daily-rotated logs to `.taskforge/logs/`.
    #[serde(default)]
    pub file: bool,
}

/// Root of `taskforge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub plans: PlansSection,
    /// Per-phase gate policy overrides.
    #[serde(default)]
    pub gates: HashMap<String, GatePolicy>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse taskforge.toml")
    }

    /// Load `taskforge.toml` from `dir`, or defaults when it does not exist.
    /// Environment overrides are applied either way.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        let mut settings = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize taskforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var("TASKFORGE_AGENT_CMD")
            && !cmd.trim().is_empty()
        {
            self.agent.command = cmd;
        }
        if let Ok(workers) = std::env::var("TASKFORGE_MAX_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => self.execution.max_workers = n,
                _ => tracing::warn!(value = %workers, "Ignoring invalid TASKFORGE_MAX_WORKERS"),
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            map: self.retry.map.clone(),
        }
    }

    pub fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            default_max_iterations: self.agent.max_iterations,
            gate_overrides: self.gates.clone(),
        }
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.iteration_timeout_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.phase_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.lease.stale_after_secs)
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.agent.command.trim().is_empty() {
            warnings.push("agent.command is empty".to_string());
        }
        if self.agent.max_iterations == 0 {
            warnings.push("agent.max_iterations is 0: every phase will fail immediately".into());
        }
        if self.agent.iteration_timeout_secs > self.agent.phase_timeout_secs {
            warnings.push(format!(
                "agent.iteration_timeout_secs ({}) exceeds agent.phase_timeout_secs ({})",
                self.agent.iteration_timeout_secs, self.agent.phase_timeout_secs
            ));
        }
        if self.execution.max_workers == 0 {
            warnings.push("execution.max_workers is 0: no task can run".to_string());
        }
        if self.lease.heartbeat_interval_secs >= self.lease.stale_after_secs {
            warnings.push(format!(
                "lease.heartbeat_interval_secs ({}) must be below lease.stale_after_secs ({}) or live tasks will look orphaned",
                self.lease.heartbeat_interval_secs, self.lease.stale_after_secs
            ));
        }

        let mut mapped: Vec<_> = self.retry.map.iter().collect();
        mapped.sort();
        for (failing, target) in mapped {
            if failing == target {
                warnings.push(format!(
                    "retry.map entry '{}' points at itself; same-phase retry is already the default",
                    failing
                ));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.retry.max_retries, 2);
        assert_eq!(settings.lease.stale_after_secs, 300);
        assert_eq!(settings.retry.map.get("test").map(String::as_str), Some("implement"));
        assert!(settings.validate().is_empty());
    }

    #[test]
    fn test_partial_file() {
        let settings = Settings::parse(
            r#"
[agent]
command = "my-agent"

[retry]
max_retries = 3

[gates]
merge = "human"
review = "ai"
"#,
        )
        .unwrap();
        assert_eq!(settings.agent.command, "my-agent");
        assert_eq!(settings.agent.max_iterations, DEFAULT_MAX_ITERATIONS);
        assert_eq!(settings.retry.max_retries, 3);
        // A [retry] table without [retry.map] keeps the default map.
        assert!(settings.retry.map.contains_key("validate"));
        let options = settings.plan_options();
        assert_eq!(options.gate_overrides.get("merge"), Some(&GatePolicy::Human));
        assert_eq!(options.gate_overrides.get("review"), Some(&GatePolicy::Agent));
    }

    #[test]
    fn test_invalid_gate_is_an_error() {
        assert!(Settings::parse("[gates]\nmerge = \"sometimes\"\n").is_err());
    }

    #[test]
    fn test_validate_warnings() {
        let mut settings = Settings::default();
        settings.lease.heartbeat_interval_secs = 600;
        settings.retry.map.insert("docs".into(), "docs".into());
        let warnings = settings.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("heartbeat_interval_secs"));
        assert!(warnings[1].contains("'docs'"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.execution.max_workers = 9;
        settings.save(&dir.path().join(SETTINGS_FILE)).unwrap();
        let loaded = Settings::load(&dir.path().join(SETTINGS_FILE)).unwrap();
        assert_eq!(loaded.execution.max_workers, 9);
    }
}
