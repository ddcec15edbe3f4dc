use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use orc_core::id::TaskId;
use orc_core::pid_guard::{GuardStatus, PidGuard};

use crate::ops::Vcs;
use crate::runner::GitRunner;

/// Worktrees live under `.orc/worktrees/` in the main checkout; the
/// directory is ephemeral and gitignored.
pub const WORKTREES_DIR: &str = ".orc/worktrees";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum WorktreeError {
    #[error("worktree in use by pid {0}")]
    InUse(u32),

    #[error("git command failed: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorktreeStatus {
    /// No directory on disk.
    Absent,
    /// Directory exists and a live executor owns it.
    InUse(u32),
    /// Directory exists with no live owner; may be reused or collected.
    Reusable,
}

#[derive(Debug, Clone)]
pub struct WorktreeHandle {
    pub path: PathBuf,
    pub branch: String,
    /// True when a previous worktree directory was repaired and reused,
    /// preserving committed work.
    pub reused: bool,
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Creates, reuses, and collects per-task worktrees.
pub struct WorktreeManager {
    repo_root: PathBuf,
    runner: Arc<dyn GitRunner>,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>, runner: Arc<dyn GitRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            runner,
        }
    }

    pub fn worktree_path(&self, task_id: &TaskId, tag: Option<&str>) -> PathBuf {
        self.repo_root
            .join(WORKTREES_DIR)
            .join(task_id.worktree_name(tag))
    }

    pub fn status(&self, path: &Path) -> WorktreeStatus {
        if !path.exists() {
            return WorktreeStatus::Absent;
        }
        match PidGuard::for_worktree(path).check() {
            GuardStatus::Running(pid) => WorktreeStatus::InUse(pid),
            GuardStatus::Free => WorktreeStatus::Reusable,
        }
    }

    /// Create the task's worktree, or reuse a leftover one whose owner is
    /// gone (cleaning any in-progress rebase/merge first, preserving
    /// committed work). Stale worktree registrations are pruned and the
    /// create retried once.
    pub async fn create_or_reuse(
        &self,
        task_id: &TaskId,
        tag: Option<&str>,
        base_branch: &str,
    ) -> Result<WorktreeHandle> {
        let branch = task_id.branch_name(tag);
        let path = self.worktree_path(task_id, tag);

        match self.status(&path) {
            WorktreeStatus::InUse(pid) => return Err(WorktreeError::InUse(pid)),
            WorktreeStatus::Reusable => {
                info!(path = %path.display(), "reusing existing worktree");
                let vcs = Vcs::new(&path, self.runner.clone());
                vcs.repair().await.map_err(|e| WorktreeError::Git(e.to_string()))?;
                return Ok(WorktreeHandle {
                    path,
                    branch,
                    reused: true,
                });
            }
            WorktreeStatus::Absent => {}
        }

        std::fs::create_dir_all(path.parent().expect("worktrees parent"))?;
        let path_str = path.display().to_string();

        info!(branch = %branch, path = %path_str, "creating worktree");
        let mut attempt =
            self.run(&["worktree", "add", "-b", &branch, &path_str, base_branch]).await?;

        if !attempt.success && attempt.stderr.contains("already registered") {
            // Stale registration from a removed directory: prune and retry.
            warn!(path = %path_str, "stale worktree registration; pruning and retrying");
            self.prune().await?;
            attempt =
                self.run(&["worktree", "add", "-b", &branch, &path_str, base_branch]).await?;
        }

        if !attempt.success && attempt.stderr.contains("already exists") {
            // The branch survived a previous run; check it out instead of
            // recreating it.
            attempt = self.run(&["worktree", "add", &path_str, &branch]).await?;
        }

        if !attempt.success {
            return Err(WorktreeError::Git(attempt.stderr.trim().to_string()));
        }

        Ok(WorktreeHandle {
            path,
            branch,
            reused: false,
        })
    }

    /// Remove one worktree directory and its registration.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let path_str = path.display().to_string();
        let out = self.run(&["worktree", "remove", "--force", &path_str]).await?;
        if !out.success {
            warn!(path = %path_str, stderr = %out.stderr.trim(), "worktree remove failed; deleting directory");
            if path.exists() {
                std::fs::remove_dir_all(path)?;
            }
            self.prune().await?;
        }
        Ok(())
    }

    /// Drop stale worktree registrations.
    pub async fn prune(&self) -> Result<()> {
        self.run(&["worktree", "prune"]).await?;
        Ok(())
    }

    /// Garbage-collect worktrees whose PID file is absent or names a dead
    /// process. Returns the removed paths.
    pub async fn gc(&self) -> Result<Vec<PathBuf>> {
        let dir = self.repo_root.join(WORKTREES_DIR);
        let mut removed = Vec::new();
        if !dir.exists() {
            return Ok(removed);
        }

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            match self.status(&path) {
                WorktreeStatus::InUse(pid) => {
                    tracing::debug!(path = %path.display(), pid = pid, "worktree in use; skipping gc");
                }
                _ => {
                    info!(path = %path.display(), "collecting abandoned worktree");
                    self.remove(&path).await?;
                    removed.push(path);
                }
            }
        }
        Ok(removed)
    }

    async fn run(&self, args: &[&str]) -> Result<crate::runner::GitOutput> {
        self.runner
            .run_git(&self.repo_root, args)
            .await
            .map_err(WorktreeError::Git)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::GitOutput;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedRunner {
        outputs: Mutex<VecDeque<GitOutput>>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<GitOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GitRunner for ScriptedRunner {
        async fn run_git(
            &self,
            _dir: &Path,
            args: &[&str],
        ) -> std::result::Result<GitOutput, String> {
            self.calls
                .lock()
                .unwrap()
                .push(args.iter().map(|s| s.to_string()).collect());
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| GitOutput::ok("")))
        }
    }

    #[test]
    fn paths_mirror_branch_names() {
        let runner = ScriptedRunner::new(vec![]);
        let mgr = WorktreeManager::new("/repo", runner);
        let id = TaskId::with_prefix("RM", 7);
        assert_eq!(
            mgr.worktree_path(&id, Some("JD")),
            PathBuf::from("/repo/.orc/worktrees/task-rm-007-jd")
        );
        assert_eq!(
            mgr.worktree_path(&TaskId::new(1), None),
            PathBuf::from("/repo/.orc/worktrees/task-001")
        );
    }

    #[tokio::test]
    async fn create_fresh_worktree() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![GitOutput::ok("")]);
        let mgr = WorktreeManager::new(dir.path(), runner.clone());

        let handle = mgr
            .create_or_reuse(&TaskId::new(42), None, "main")
            .await
            .unwrap();
        assert_eq!(handle.branch, "orc/task-042");
        assert!(!handle.reused);

        let calls = runner.calls();
        assert_eq!(calls[0][0], "worktree");
        assert_eq!(calls[0][1], "add");
        assert_eq!(calls[0][3], "orc/task-042");
    }

    #[tokio::test]
    async fn stale_registration_pruned_and_retried() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(vec![
            GitOutput::err("fatal: '...' is already registered"),
            GitOutput::ok(""), // prune
            GitOutput::ok(""), // retry add
        ]);
        let mgr = WorktreeManager::new(dir.path(), runner.clone());

        let handle = mgr
            .create_or_reuse(&TaskId::new(1), None, "main")
            .await
            .unwrap();
        assert!(!handle.reused);

        let calls = runner.calls();
        assert_eq!(calls[1], vec!["worktree", "prune"]);
        assert_eq!(calls[2][1], "add");
    }

    #[tokio::test]
    async fn existing_dir_without_owner_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let wt = dir.path().join(WORKTREES_DIR).join("task-001");
        std::fs::create_dir_all(&wt).unwrap();

        // repair(): rev-parse --git-path x2 (rebase dirs), MERGE_HEAD probe
        let runner = ScriptedRunner::new(vec![
            GitOutput::ok("nonexistent-rebase-merge\n"),
            GitOutput::ok("nonexistent-rebase-apply\n"),
            GitOutput::ok("nonexistent-MERGE_HEAD\n"),
        ]);
        let mgr = WorktreeManager::new(dir.path(), runner);

        let handle = mgr
            .create_or_reuse(&TaskId::new(1), None, "main")
            .await
            .unwrap();
        assert!(handle.reused);
        assert_eq!(handle.path, wt);
    }

    #[tokio::test]
    async fn in_use_worktree_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let wt = dir.path().join(WORKTREES_DIR).join("task-001");
        std::fs::create_dir_all(&wt).unwrap();
        PidGuard::for_worktree(&wt).acquire().unwrap();

        let runner = ScriptedRunner::new(vec![]);
        let mgr = WorktreeManager::new(dir.path(), runner);
        let err = mgr
            .create_or_reuse(&TaskId::new(1), None, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, WorktreeError::InUse(pid) if pid == std::process::id()));
    }

    #[tokio::test]
    async fn gc_collects_only_dead_worktrees() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join(WORKTREES_DIR).join("task-001");
        let dead = dir.path().join(WORKTREES_DIR).join("task-002");
        std::fs::create_dir_all(&live).unwrap();
        std::fs::create_dir_all(&dead).unwrap();
        PidGuard::for_worktree(&live).acquire().unwrap();

        let runner = ScriptedRunner::new(vec![GitOutput::ok("")]);
        let mgr = WorktreeManager::new(dir.path(), runner);

        let removed = mgr.gc().await.unwrap();
        assert_eq!(removed, vec![dead]);
        assert!(live.exists());
    }
}
