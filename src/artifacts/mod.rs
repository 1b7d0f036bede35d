//! Phase artifacts and skip detection.
//!
//! Phases may declare the files they produce (for example `spec.md`). When
//! every declared file already exists with meaningful content, the
//! [`ArtifactInspector`] reports the phase as skippable so work done outside
//! the engine, or before a crash, is not redone.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::plan::PhaseSpec;

/// Minimum non-whitespace characters for an artifact to count as real output.
pub const MIN_MEANINGFUL_CONTENT: usize = 50;

/// Artifacts larger than this are treated as suspect and never satisfy a phase.
pub const MAX_ARTIFACT_SIZE: u64 = 5 * 1024 * 1024;

/// Storage for per-task phase output files.
pub trait ArtifactStore: Send + Sync {
    /// Size in bytes, or `None` when the artifact does not exist.
    fn size(&self, task_id: &str, name: &str) -> Result<Option<u64>>;
    fn read(&self, task_id: &str, name: &str) -> Result<Option<String>>;
    fn write(&self, task_id: &str, name: &str, content: &str) -> Result<()>;
    /// Remove all artifacts for a task. Missing directories are not an error.
    fn clear(&self, task_id: &str) -> Result<()>;
}

/// Artifacts stored as files under `<root>/<task_id>/<name>`.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, task_id: &str, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
            anyhow::bail!("Artifact name '{}' must be a relative path inside the task", name);
        }
        Ok(self.root.join(task_id).join(rel))
    }
}

impl ArtifactStore for FsArtifactStore {
    fn size(&self, task_id: &str, name: &str) -> Result<Option<u64>> {
        let path = self.path(task_id, name)?;
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        }
    }

    fn read(&self, task_id: &str, name: &str) -> Result<Option<String>> {
        let path = self.path(task_id, name)?;
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write(&self, task_id: &str, name: &str, content: &str) -> Result<()> {
        let path = self.path(task_id, name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn clear(&self, task_id: &str) -> Result<()> {
        let dir = self.root.join(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }
}

/// Outcome of a skip check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipDecision {
    pub skippable: bool,
    pub reason: String,
}

impl SkipDecision {
    fn no(reason: impl Into<String>) -> Self {
        Self {
            skippable: false,
            reason: reason.into(),
        }
    }
}

/// Decides whether a phase's declared artifacts already satisfy it.
pub struct ArtifactInspector<'a> {
    store: &'a dyn ArtifactStore,
}

impl<'a> ArtifactInspector<'a> {
    pub fn new(store: &'a dyn ArtifactStore) -> Self {
        Self { store }
    }

    /// Pure function of the store contents: repeated calls on unchanged
    /// artifacts return the same decision.
    pub fn can_skip(&self, task_id: &str, phase: &PhaseSpec) -> Result<SkipDecision> {
        if phase.artifacts.is_empty() {
            return Ok(SkipDecision::no("phase declares no artifacts"));
        }

        for name in &phase.artifacts {
            let Some(size) = self.store.size(task_id, name)? else {
                return Ok(SkipDecision::no(format!("{} does not exist", name)));
            };
            if size > MAX_ARTIFACT_SIZE {
                return Ok(SkipDecision::no(format!(
                    "{} is larger than {} bytes",
                    name, MAX_ARTIFACT_SIZE
                )));
            }
            let content = self.store.read(task_id, name)?.unwrap_or_default();
            let meaningful = content.chars().filter(|c| !c.is_whitespace()).count();
            if meaningful < MIN_MEANINGFUL_CONTENT {
                return Ok(SkipDecision::no(format!(
                    "{} has only {} meaningful characters",
                    name, meaningful
                )));
            }
        }

        Ok(SkipDecision {
            skippable: true,
            reason: format!("artifacts already present: {}", phase.artifacts.join(", ")),
        })
    }
}

/// Name of the file a phase's approved output is written to.
pub fn output_artifact_name(phase_id: &str) -> String {
    format!("{}.md", phase_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn phase_with(artifacts: &[&str]) -> PhaseSpec {
        let mut phase = PhaseSpec::new("spec");
        phase.artifacts = artifacts.iter().map(|s| s.to_string()).collect();
        phase
    }

    #[test]
    fn test_phase_without_artifacts_never_skips() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let decision = ArtifactInspector::new(&store)
            .can_skip("TASK-001", &phase_with(&[]))
            .unwrap();
        assert!(!decision.skippable);
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let decision = ArtifactInspector::new(&store)
            .can_skip("TASK-001", &phase_with(&["spec.md"]))
            .unwrap();
        assert!(!decision.skippable);
        assert!(decision.reason.contains("does not exist"));
    }

    #[test]
    fn test_short_artifact_is_not_meaningful() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write("TASK-001", "spec.md", "# TODO\n\n   \n").unwrap();
        let decision = ArtifactInspector::new(&store)
            .can_skip("TASK-001", &phase_with(&["spec.md"]))
            .unwrap();
        assert!(!decision.skippable);
        assert!(decision.reason.contains("meaningful"));
    }

    #[test]
    fn test_skip_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store
            .write("TASK-001", "spec.md", &"The widget must render quickly. ".repeat(4))
            .unwrap();
        let inspector = ArtifactInspector::new(&store);
        let phase = phase_with(&["spec.md"]);
        let first = inspector.can_skip("TASK-001", &phase).unwrap();
        let second = inspector.can_skip("TASK-001", &phase).unwrap();
        assert!(first.skippable);
        assert_eq!(first, second);
    }

    #[test]
    fn test_artifacts_are_scoped_per_task() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store
            .write("TASK-001", "spec.md", &"x".repeat(MIN_MEANINGFUL_CONTENT))
            .unwrap();
        let inspector = ArtifactInspector::new(&store);
        assert!(inspector.can_skip("TASK-001", &phase_with(&["spec.md"])).unwrap().skippable);
        assert!(!inspector.can_skip("TASK-002", &phase_with(&["spec.md"])).unwrap().skippable);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        assert!(store.write("TASK-001", "../other/spec.md", "x").is_err());
        assert!(store.read("TASK-001", "/etc/passwd").is_err());
    }

    #[test]
    fn test_clear_removes_task_artifacts() {
        let dir = tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        store.write("TASK-001", "spec.md", "content").unwrap();
        store.clear("TASK-001").unwrap();
        assert_eq!(store.read("TASK-001", "spec.md").unwrap(), None);
        store.clear("TASK-001").unwrap();
    }
}
