use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::settings::{SETTINGS_FILE, Settings};

pub const TASKFORGE_DIR: &str = ".taskforge";

/// Runtime configuration for a project.
///
/// Resolves the `.taskforge/` layout under the project root and carries the
/// parsed [`Settings`].
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub taskforge_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub worktrees_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub log_dir: PathBuf,
    pub settings: Settings,
}

impl Config {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let taskforge_dir = project_dir.join(TASKFORGE_DIR);
        let settings = Settings::load_or_default(&taskforge_dir)?;
        Ok(Self::with_settings(project_dir, settings))
    }

    pub fn with_settings(project_dir: PathBuf, settings: Settings) -> Self {
        let taskforge_dir = project_dir.join(TASKFORGE_DIR);
        Self {
            tasks_dir: taskforge_dir.join("tasks"),
            worktrees_dir: taskforge_dir.join("worktrees"),
            artifacts_dir: taskforge_dir.join("artifacts"),
            log_dir: taskforge_dir.join("logs"),
            taskforge_dir,
            project_dir,
            settings,
        }
    }

    pub fn settings_file(&self) -> PathBuf {
        self.taskforge_dir.join(SETTINGS_FILE)
    }

    /// Plan template directory. Relative `[plans] dir` values resolve
    /// against `.taskforge/`.
    pub fn plans_dir(&self) -> PathBuf {
        match &self.settings.plans.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.taskforge_dir.join(dir),
            None => self.taskforge_dir.join("plans"),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.taskforge_dir.is_dir()
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.tasks_dir,
            &self.worktrees_dir,
            &self.artifacts_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        std::fs::create_dir_all(self.plans_dir()).context("Failed to create plans directory")?;
        Ok(())
    }
}
