//! End-to-end tests for the `taskforge` binary, with the agent replaced by a
//! replay script.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use git2::{Repository, Signature};
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const REPLAY: &str = r#"
"*":
  - "all done <phase_complete>the phase produced what it needed to</phase_complete>"
"#;

fn taskforge(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("taskforge");
    cmd.current_dir(dir.path())
        .env_remove("TASKFORGE_REPLAY")
        .env_remove("TASKFORGE_AGENT_CMD")
        .env_remove("TASKFORGE_MAX_WORKERS")
        .env_remove("RUST_LOG");
    cmd
}

fn init_repo_with_commit(path: &Path) {
    let repo = Repository::init(path).unwrap();
    fs::write(path.join("README.md"), "# project\n").unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new("README.md")).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}

/// An initialized project in a git repository, plus a replay script.
fn project() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    init_repo_with_commit(dir.path());
    taskforge(&dir).arg("init").assert().success();
    let script = dir.path().join("replay.yaml");
    fs::write(&script, REPLAY).unwrap();
    (dir, script)
}

fn new_trivial_task(dir: &TempDir) {
    taskforge(dir)
        .args(["new", "Fix typo in README", "--weight", "trivial"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created TASK-001"))
        .stdout(predicate::str::contains("tiny_spec -> implement"));
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_and_version() {
        let dir = TempDir::new().unwrap();
        taskforge(&dir).arg("--help").assert().success();
        taskforge(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = TempDir::new().unwrap();
        taskforge(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized taskforge project"));

        let root = dir.path().join(".taskforge");
        assert!(root.join("tasks").is_dir());
        assert!(root.join("worktrees").is_dir());
        assert!(root.join("artifacts").is_dir());
        assert!(root.join("plans").is_dir());
        assert!(root.join("taskforge.toml").is_file());
        assert_eq!(fs::read_to_string(root.join(".gitignore")).unwrap(), "*\n");

        taskforge(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        taskforge(&dir)
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("taskforge init"));
    }

    #[test]
    fn test_invalid_weight_is_rejected() {
        let (dir, _) = project();
        taskforge(&dir)
            .args(["new", "Something", "--weight", "enormous"])
            .assert()
            .failure();
    }
}

mod task_lifecycle {
    use super::*;

    #[test]
    fn test_run_to_completion_with_replay() {
        let (dir, script) = project();
        new_trivial_task(&dir);

        taskforge(&dir)
            .arg("--replay")
            .arg(&script)
            .args(["run", "TASK-001"])
            .assert()
            .success()
            .stdout(predicate::str::contains("checkpoint #1 for tiny_spec"))
            .stdout(predicate::str::contains("TASK-001 is completed"));

        taskforge(&dir)
            .args(["status", "TASK-001"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        let output = taskforge(&dir)
            .args(["checkpoints", "TASK-001"])
            .output()
            .unwrap();
        let stdout = String::from_utf8(output.stdout).unwrap();
        assert_eq!(stdout.lines().count(), 2);
        assert!(stdout.contains("implement"));

        let artifact = dir.path().join(".taskforge/artifacts/TASK-001/implement.md");
        assert!(artifact.is_file());
    }

    #[test]
    fn test_status_json_is_machine_readable() {
        let (dir, _) = project();
        new_trivial_task(&dir);
        let output = taskforge(&dir)
            .args(["status", "TASK-001", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(value["task"]["id"], "TASK-001");
        assert_eq!(value["task"]["status"], "planned");
    }

    #[test]
    fn test_human_gate_waits_for_approval() {
        let (dir, script) = project();
        fs::write(
            dir.path().join(".taskforge/taskforge.toml"),
            "[gates]\nimplement = \"human\"\n",
        )
        .unwrap();
        new_trivial_task(&dir);

        taskforge(&dir)
            .arg("--replay")
            .arg(&script)
            .args(["run", "TASK-001"])
            .assert()
            .success()
            .stdout(predicate::str::contains("waiting for review"));

        taskforge(&dir)
            .arg("--replay")
            .arg(&script)
            .args(["approve", "TASK-001", "implement", "--comment", "lgtm"])
            .assert()
            .success()
            .stdout(predicate::str::contains("TASK-001 is completed"));
    }

    #[test]
    fn test_resolve_refuses_task_that_has_not_failed() {
        let (dir, _) = project();
        new_trivial_task(&dir);
        taskforge(&dir)
            .args(["resolve", "TASK-001", "--message", "done by hand"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Cannot resolve task TASK-001 while it is planned"));
    }

    #[test]
    fn test_unknown_task() {
        let (dir, _) = project();
        taskforge(&dir)
            .args(["status", "TASK-042"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Task TASK-042 not found"));
    }

    #[test]
    fn test_skip_then_list() {
        let (dir, _) = project();
        new_trivial_task(&dir);
        taskforge(&dir)
            .args(["skip", "TASK-001", "tiny_spec", "--reason", "obvious fix"])
            .assert()
            .success();
        taskforge(&dir)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("TASK-001"))
            .stdout(predicate::str::contains("Fix typo in README"));
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_prints_effective_settings() {
        let (dir, _) = project();
        taskforge(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[agent]"))
            .stdout(predicate::str::contains("max_workers = 4"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let (dir, _) = project();
        fs::write(
            dir.path().join(".taskforge/taskforge.toml"),
            "[execution]\nmax_workers = 0\n",
        )
        .unwrap();
        taskforge(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_workers is 0"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let (dir, _) = project();
        taskforge(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }
}
