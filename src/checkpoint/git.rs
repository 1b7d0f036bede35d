//! git2-backed [`VersionControl`]: one branch and worktree per task.

use std::path::PathBuf;

use git2::build::CheckoutBuilder;
use git2::{
    BranchType, IndexAddOption, Oid, Repository, ResetType, Signature, StatusOptions,
    WorktreeAddOptions, WorktreePruneOptions,
};

use crate::errors::VcsError;

use super::{VersionControl, WorkspaceRef};

const BRANCH_PREFIX: &str = "taskforge/";
const PIN_PREFIX: &str = "refs/taskforge/";

fn remove_untracked(repo: &Repository, root: &std::path::Path) -> Result<(), VcsError> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .recurse_untracked_dirs(false)
        .include_ignored(false);
    let statuses = repo.statuses(Some(&mut opts))?;
    for entry in statuses.iter().filter(|e| e.status().is_wt_new()) {
        let Some(rel) = entry.path() else { continue };
        let path = root.join(rel.trim_end_matches('/'));
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|source| VcsError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(())
}

pub struct GitVersionControl {
    repo_path: PathBuf,
    worktrees_dir: PathBuf,
}

impl GitVersionControl {
    pub fn new(repo_path: impl Into<PathBuf>, worktrees_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            worktrees_dir: worktrees_dir.into(),
        }
    }

    fn open_main(&self) -> Result<Repository, VcsError> {
        Ok(Repository::open(&self.repo_path)?)
    }

    fn open_workspace(&self, ws: &WorkspaceRef) -> Result<Repository, VcsError> {
        Ok(Repository::open(&ws.path)?)
    }

    fn find_commit<'r>(repo: &'r Repository, sha: &str) -> Result<git2::Commit<'r>, VcsError> {
        let missing = || VcsError::CheckpointMissing {
            commit: sha.to_string(),
        };
        let oid = Oid::from_str(sha).map_err(|_| missing())?;
        repo.find_commit(oid).map_err(|_| missing())
    }

    /// Create `taskforge/<task_id>` at `commit` and check it out in a new worktree.
    fn add_worktree(&self, task_id: &str, commit: &str) -> Result<WorkspaceRef, VcsError> {
        let repo = self.open_main()?;
        let branch_name = format!("{}{}", BRANCH_PREFIX, task_id);
        let path = self.worktrees_dir.join(task_id);

        if repo.find_branch(&branch_name, BranchType::Local).is_ok() {
            // A previous run may have created the workspace and crashed
            // before recording it.
            if path.join(".git").exists() {
                let existing = Repository::open(&path)?;
                let on_branch = existing
                    .head()
                    .ok()
                    .and_then(|h| h.shorthand().map(str::to_string))
                    .is_some_and(|name| name == branch_name);
                if on_branch {
                    tracing::info!(task_id, path = %path.display(), "Reusing existing workspace");
                    return Ok(WorkspaceRef {
                        branch: branch_name,
                        path,
                        base_commit: commit.to_string(),
                    });
                }
            }
            return Err(VcsError::BranchConflict {
                branch: branch_name,
            });
        }
        if path.exists() {
            return Err(VcsError::BranchConflict {
                branch: branch_name,
            });
        }

        std::fs::create_dir_all(&self.worktrees_dir).map_err(|source| VcsError::Io {
            path: self.worktrees_dir.clone(),
            source,
        })?;

        let target = Self::find_commit(&repo, commit)?;
        let branch = repo.branch(&branch_name, &target, false)?;
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch.get()));
        repo.worktree(task_id, &path, Some(&opts))?;

        tracing::info!(task_id, branch = %branch_name, path = %path.display(), "Created workspace");
        Ok(WorkspaceRef {
            branch: branch_name,
            path,
            base_commit: commit.to_string(),
        })
    }
}

fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head().ok().and_then(|head| head.peel_to_commit().ok())
}

fn worktree_name(ws: &WorkspaceRef) -> Option<&str> {
    ws.path.file_name().and_then(|n| n.to_str())
}

impl VersionControl for GitVersionControl {
    fn create_workspace(&self, task_id: &str) -> Result<WorkspaceRef, VcsError> {
        let repo = self.open_main()?;
        let base = head_commit(&repo)
            .ok_or_else(|| git2::Error::from_str("repository has no commits to branch from"))?
            .id()
            .to_string();
        drop(repo);
        self.add_worktree(task_id, &base)
    }

    fn fork_workspace(&self, task_id: &str, commit: &str) -> Result<WorkspaceRef, VcsError> {
        self.add_worktree(task_id, commit)
    }

    fn remove_workspace(&self, ws: &WorkspaceRef) -> Result<(), VcsError> {
        let repo = self.open_main()?;
        if let Some(name) = worktree_name(ws)
            && let Ok(worktree) = repo.find_worktree(name)
        {
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            worktree.prune(Some(&mut opts))?;
        }
        if ws.path.exists() {
            std::fs::remove_dir_all(&ws.path).map_err(|source| VcsError::Io {
                path: ws.path.clone(),
                source,
            })?;
        }
        if let Ok(mut branch) = repo.find_branch(&ws.branch, BranchType::Local) {
            branch.delete()?;
        }
        Ok(())
    }

    fn head(&self, ws: &WorkspaceRef) -> Result<Option<String>, VcsError> {
        let repo = self.open_workspace(ws)?;
        Ok(head_commit(&repo).map(|c| c.id().to_string()))
    }

    fn commit(&self, ws: &WorkspaceRef, message: &str) -> Result<String, VcsError> {
        let repo = self.open_workspace(ws)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("taskforge", "taskforge@localhost")?;

        let commit_id = match head_commit(&repo) {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };
        Ok(commit_id.to_string())
    }

    fn checkout(&self, ws: &WorkspaceRef, commit: &str, force: bool) -> Result<(), VcsError> {
        let repo = self.open_workspace(ws)?;
        if !force && self.is_dirty(ws)? {
            return Err(VcsError::DirtyWorkingTree {
                path: ws.path.clone(),
            });
        }
        let target = Self::find_commit(&repo, commit)?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.reset(target.as_object(), ResetType::Hard, Some(&mut checkout))?;
        // A hard reset leaves untracked files behind.
        remove_untracked(&repo, &ws.path)
    }

    fn is_dirty(&self, ws: &WorkspaceRef) -> Result<bool, VcsError> {
        let repo = self.open_workspace(ws)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        Ok(!repo.statuses(Some(&mut opts))?.is_empty())
    }

    fn changed_files(
        &self,
        ws: &WorkspaceRef,
        from: &str,
        to: &str,
    ) -> Result<Vec<String>, VcsError> {
        let repo = self.open_workspace(ws)?;
        let from_tree = Self::find_commit(&repo, from)?.tree()?;
        let to_tree = Self::find_commit(&repo, to)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;
        let files = diff
            .deltas()
            .filter_map(|d| d.new_file().path().or_else(|| d.old_file().path()))
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        Ok(files)
    }

    fn pin(&self, name: &str, commit: &str) -> Result<(), VcsError> {
        let repo = self.open_main()?;
        let oid = Self::find_commit(&repo, commit)?.id();
        repo.reference(
            &format!("{}{}", PIN_PREFIX, name),
            oid,
            true,
            "taskforge checkpoint",
        )?;
        Ok(())
    }

    fn unpin(&self, name: &str) -> Result<(), VcsError> {
        let repo = self.open_main()?;
        match repo.find_reference(&format!("{}{}", PIN_PREFIX, name)) {
            Ok(mut reference) => Ok(reference.delete()?),
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
