//! Configuration view and validation commands: `taskforge config`.

use anyhow::Result;
use std::path::Path;

use taskforge::config::Config;
use taskforge::settings::Settings;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::new(project_dir)?;
    let config_path = config.settings_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Taskforge Configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No taskforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();
            // Effective values, after environment overrides.
            print!("{}", toml::to_string_pretty(&config.settings)?);
            println!();
            println!("Plan templates: {}", config.plans_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No taskforge.toml found. Using defaults (valid).");
                return Ok(());
            }
            let settings = Settings::load(&config_path)?;
            let warnings = settings.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("taskforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.taskforge_dir)?;
            Settings::default().save(&config_path)?;

            println!("Created taskforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [agent] command, args, timeouts, max_iterations");
            println!("  - [execution] max_workers, auto_skip");
            println!("  - [retry] max_retries and the failing -> target phase map");
            println!("  - [gates] per-phase gate policies (auto, agent, human)");
            println!();
        }
    }

    Ok(())
}
