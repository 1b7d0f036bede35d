//! Project initialization: `taskforge init`.

use anyhow::{Context, Result};
use std::path::Path;

use taskforge::config::Config;
use taskforge::settings::Settings;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::new(project_dir)?;
    let was_initialized = config.is_initialized();
    config.ensure_directories()?;

    let settings_file = config.settings_file();
    if !settings_file.exists() {
        Settings::default().save(&settings_file)?;
    }
    // Keep engine state out of the project's own history.
    let ignore = config.taskforge_dir.join(".gitignore");
    if !ignore.exists() {
        std::fs::write(&ignore, "*\n").context("Failed to write .taskforge/.gitignore")?;
    }

    if was_initialized {
        println!(
            "Taskforge project already initialized at {}",
            config.taskforge_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    println!(
        "Initialized taskforge project at {}",
        config.taskforge_dir.display()
    );
    println!();
    println!("Created directory structure:");
    println!("  .taskforge/");
    println!("  ├── taskforge.toml  # Settings (use `taskforge config`)");
    println!("  ├── tasks/          # Task state");
    println!("  ├── worktrees/      # One git worktree per task");
    println!("  ├── artifacts/      # Phase outputs");
    println!("  ├── plans/          # Plan template overrides");
    println!("  └── logs/");
    println!();
    println!("Next steps:");
    println!("  1. Run `taskforge new \"<title>\" --weight small` to create a task");
    println!("  2. Run `taskforge run <TASK-ID>` to start execution");
    Ok(())
}
