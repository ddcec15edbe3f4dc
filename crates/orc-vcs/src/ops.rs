use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use orc_core::id::TaskId;

use crate::runner::{parse_porcelain_paths, GitRunner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    Git(String),

    #[error("refusing to force-push protected branch: {0}")]
    ProtectedBranch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VcsError>;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of a checkpoint attempt. `None` commit id means there was nothing
/// to commit, which is not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub commit_id: Option<String>,
    pub files: Vec<String>,
}

/// How a sync with the target branch went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOutcome {
    /// Up to date or successfully rebased/merged.
    Clean,
    /// Conflicts were detected; the worktree was left (or restored to) a
    /// clean state and the caller decides what to do.
    Conflicts {
        files: Vec<String>,
        resolution_script: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Rebase onto the target (phase / start-of-run syncs).
    Rebase,
    /// Merge the target in (finalize).
    Merge,
    /// Dry-run merge: report conflicts without mutating the worktree.
    Detect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed,
    ForcedWithLease,
}

// ---------------------------------------------------------------------------
// Vcs
// ---------------------------------------------------------------------------

/// Git operations against one working directory (usually a task worktree).
///
/// The internal mutex covers *compound* operations only; single git commands
/// are atomic on their own. Different worktrees get independent instances
/// and never contend.
pub struct Vcs {
    workdir: PathBuf,
    runner: Arc<dyn GitRunner>,
    compound: Mutex<()>,
}

impl Vcs {
    pub fn new(workdir: impl Into<PathBuf>, runner: Arc<dyn GitRunner>) -> Self {
        Self {
            workdir: workdir.into(),
            runner,
            compound: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn git(&self, args: &[&str]) -> Result<crate::runner::GitOutput> {
        self.runner
            .run_git(&self.workdir, args)
            .await
            .map_err(VcsError::Git)
    }

    /// Run a git command, treating a non-zero exit as an error.
    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.git(args).await?;
        if !out.success {
            return Err(VcsError::Git(format!(
                "git {}: {}",
                args.join(" "),
                out.stderr.trim()
            )));
        }
        Ok(out.stdout)
    }

    // -----------------------------------------------------------------------
    // Detection / repair primitives
    // -----------------------------------------------------------------------

    pub async fn is_clean(&self) -> Result<bool> {
        Ok(self.changed_paths().await?.is_empty())
    }

    /// Changed paths, with the engine's own `.orc/` bookkeeping (PID guard,
    /// locks) filtered out — those never count as task work.
    pub async fn changed_paths(&self) -> Result<Vec<String>> {
        #[cfg(feature = "libgit2")]
        {
            if let Ok(paths) = crate::git2_read::Git2Read::changed_paths(&self.workdir) {
                return Ok(filter_bookkeeping(paths));
            }
            // Fall through to shell-out on any libgit2 failure.
        }
        let out = self.git_ok(&["status", "--porcelain"]).await?;
        Ok(filter_bookkeeping(parse_porcelain_paths(&out)))
    }

    pub async fn head(&self) -> Result<String> {
        let out = self.git_ok(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn current_branch(&self) -> Result<String> {
        let out = self.git_ok(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    pub async fn is_rebase_in_progress(&self) -> Result<bool> {
        for dir in ["rebase-merge", "rebase-apply"] {
            let out = self.git_ok(&["rev-parse", "--git-path", dir]).await?;
            let path = self.resolve_git_path(out.trim());
            if path.exists() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn is_merge_in_progress(&self) -> Result<bool> {
        let out = self.git_ok(&["rev-parse", "--git-path", "MERGE_HEAD"]).await?;
        Ok(self.resolve_git_path(out.trim()).exists())
    }

    fn resolve_git_path(&self, p: &str) -> PathBuf {
        let path = Path::new(p);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workdir.join(path)
        }
    }

    pub async fn abort_rebase(&self) -> Result<()> {
        // Aborting when no rebase is running is not an error worth surfacing.
        let out = self.git(&["rebase", "--abort"]).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), "rebase --abort was a no-op");
        }
        Ok(())
    }

    pub async fn abort_merge(&self) -> Result<()> {
        let out = self.git(&["merge", "--abort"]).await?;
        if !out.success {
            tracing::debug!(stderr = %out.stderr.trim(), "merge --abort was a no-op");
        }
        Ok(())
    }

    pub async fn discard_changes(&self) -> Result<()> {
        self.git_ok(&["reset", "--hard", "HEAD"]).await?;
        self.git_ok(&["clean", "-fd"]).await?;
        Ok(())
    }

    /// Clean any in-progress rebase or merge, then discard local changes.
    /// Used when reusing a worktree left behind by a dead executor.
    pub async fn repair(&self) -> Result<()> {
        if self.is_rebase_in_progress().await? {
            warn!(workdir = %self.workdir.display(), "cleaning in-progress rebase");
            self.abort_rebase().await?;
        }
        if self.is_merge_in_progress().await? {
            warn!(workdir = %self.workdir.display(), "cleaning in-progress merge");
            self.abort_merge().await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoint / rewind
    // -----------------------------------------------------------------------

    /// Stage everything and commit a checkpoint. Compound: stage + diff +
    /// commit run under the instance mutex.
    pub async fn checkpoint(
        &self,
        commit_prefix: &str,
        task_id: &TaskId,
        phase: &str,
        status: &str,
        iteration: u32,
        duration_secs: u64,
    ) -> Result<CheckpointInfo> {
        let _guard = self.compound.lock().await;

        self.git_ok(&["add", "-A", "--", ".", ":(exclude).orc"]).await?;
        let staged = self.git_ok(&["diff", "--cached", "--name-only"]).await?;
        let files: Vec<String> = staged
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        if files.is_empty() {
            info!(task_id = %task_id, phase = %phase, "nothing to checkpoint");
            return Ok(CheckpointInfo {
                commit_id: None,
                files,
            });
        }

        let message =
            checkpoint_message(commit_prefix, task_id, phase, status, iteration, duration_secs, &files);
        self.git_ok(&["commit", "-m", &message]).await?;
        let commit_id = self.head().await?;

        info!(task_id = %task_id, phase = %phase, commit = %commit_id, "checkpoint committed");
        Ok(CheckpointInfo {
            commit_id: Some(commit_id),
            files,
        })
    }

    /// Hard reset to a prior checkpoint.
    pub async fn rewind(&self, commit: &str) -> Result<()> {
        let _guard = self.compound.lock().await;
        self.git_ok(&["reset", "--hard", commit]).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    /// Bring the worktree up to date with `target`. On conflict the worktree
    /// is always restored to a clean state; the outcome reports the
    /// conflicted paths and a contextual resolution script.
    pub async fn sync(&self, target: &str, mode: SyncMode) -> Result<SyncOutcome> {
        let _guard = self.compound.lock().await;

        match mode {
            SyncMode::Detect => self.detect_conflicts(target).await,
            SyncMode::Rebase => {
                let out = self.git(&["rebase", target]).await?;
                if out.success {
                    return Ok(SyncOutcome::Clean);
                }
                let files = self.conflicted_files().await?;
                self.abort_rebase().await?;
                warn!(target = %target, conflicts = ?files, "rebase conflicts; aborted cleanly");
                Ok(SyncOutcome::Conflicts {
                    resolution_script: resolution_script(&self.workdir, target, "rebase", &files),
                    files,
                })
            }
            SyncMode::Merge => {
                let out = self.git(&["merge", "--no-edit", target]).await?;
                if out.success {
                    return Ok(SyncOutcome::Clean);
                }
                let files = self.conflicted_files().await?;
                self.abort_merge().await?;
                warn!(target = %target, conflicts = ?files, "merge conflicts; aborted cleanly");
                Ok(SyncOutcome::Conflicts {
                    resolution_script: resolution_script(&self.workdir, target, "merge", &files),
                    files,
                })
            }
        }
    }

    /// Dry-run merge: report conflicts without mutating the worktree.
    async fn detect_conflicts(&self, target: &str) -> Result<SyncOutcome> {
        let out = self.git(&["merge", "--no-commit", "--no-ff", target]).await?;
        let conflicts = if out.success {
            Vec::new()
        } else {
            self.conflicted_files().await?
        };
        // Undo whatever the dry run staged; a no-op when already up to date.
        self.abort_merge().await?;
        if conflicts.is_empty() {
            Ok(SyncOutcome::Clean)
        } else {
            Ok(SyncOutcome::Conflicts {
                resolution_script: resolution_script(&self.workdir, target, "merge", &conflicts),
                files: conflicts,
            })
        }
    }

    /// Start a merge and leave any conflict state in place (the caller
    /// resolves or aborts). Returns whether the merge completed cleanly.
    pub async fn begin_merge(&self, target: &str) -> Result<bool> {
        let out = self.git(&["merge", "--no-edit", target]).await?;
        Ok(out.success)
    }

    /// Commit a merge whose conflicts were resolved by staging.
    pub async fn commit_merge(&self) -> Result<()> {
        self.git_ok(&["commit", "--no-edit"]).await?;
        Ok(())
    }

    pub async fn conflicted_files(&self) -> Result<Vec<String>> {
        let out = self
            .git_ok(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    /// Push `branch` to origin. A non-fast-forward rejection is retried once
    /// with `--force-with-lease`; a plain `--force` is never used, and no
    /// force of any kind touches a protected branch.
    pub async fn push(&self, branch: &str, protected: &[String]) -> Result<PushOutcome> {
        let out = self.git(&["push", "origin", branch]).await?;
        if out.success {
            return Ok(PushOutcome::Pushed);
        }

        if !is_non_fast_forward(&out.stderr) {
            return Err(VcsError::Git(format!("git push: {}", out.stderr.trim())));
        }

        if is_protected(branch, protected) {
            return Err(VcsError::ProtectedBranch(branch.to_string()));
        }

        info!(branch = %branch, "non-fast-forward; retrying with --force-with-lease");
        let out = self
            .git(&["push", "--force-with-lease", "origin", branch])
            .await?;
        if out.success {
            Ok(PushOutcome::ForcedWithLease)
        } else {
            Err(VcsError::Git(format!(
                "git push --force-with-lease: {}",
                out.stderr.trim()
            )))
        }
    }

    /// Explicit force request (finalize paths). Refused outright for
    /// protected branches before any git command runs.
    pub async fn force_push(&self, branch: &str, protected: &[String]) -> Result<PushOutcome> {
        if is_protected(branch, protected) {
            return Err(VcsError::ProtectedBranch(branch.to_string()));
        }
        self.git_ok(&["push", "--force-with-lease", "origin", branch])
            .await?;
        Ok(PushOutcome::ForcedWithLease)
    }

    /// Content of one merge stage (1 = base, 2 = ours, 3 = theirs) of a
    /// conflicted file.
    pub async fn show_stage(&self, stage: u8, file: &str) -> Result<String> {
        self.git_ok(&["show", &format!(":{stage}:{file}")]).await
    }

    pub async fn stage(&self, file: &str) -> Result<()> {
        self.git_ok(&["add", file]).await?;
        Ok(())
    }

    pub async fn fetch(&self, remote: &str) -> Result<()> {
        self.git_ok(&["fetch", remote]).await?;
        Ok(())
    }

    pub async fn delete_local_branch(&self, branch: &str) -> Result<()> {
        let out = self.git(&["branch", "-D", branch]).await?;
        if !out.success {
            tracing::debug!(branch = %branch, stderr = %out.stderr.trim(), "branch delete was a no-op");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Checkpoint commit message: subject `<prefix> <TASK_ID>: <phase> - <status>`
/// plus a structured body.
pub fn checkpoint_message(
    prefix: &str,
    task_id: &TaskId,
    phase: &str,
    status: &str,
    iteration: u32,
    duration_secs: u64,
    files: &[String],
) -> String {
    let mut message = format!("{prefix} {task_id}: {phase} - {status}\n\n");
    message.push_str(&format!("Phase: {phase}\n"));
    message.push_str(&format!("Status: {status}\n"));
    message.push_str(&format!("Iteration: {iteration}\n"));
    message.push_str(&format!("Duration: {duration_secs}s\n"));
    message.push_str("Files:\n");
    for file in files {
        message.push_str(&format!("  - {file}\n"));
    }
    message
}

/// Whether `branch` matches any protected pattern. A pattern ending in `/*`
/// protects the whole prefix (`release/*` covers `release/1.2`).
pub fn is_protected(branch: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix("/*") {
            branch.starts_with(prefix) && branch[prefix.len()..].starts_with('/')
        } else {
            branch == pattern
        }
    })
}

fn filter_bookkeeping(paths: Vec<String>) -> Vec<String> {
    paths
        .into_iter()
        .filter(|p| !p.starts_with(".orc/") && p != ".orc")
        .collect()
}

fn is_non_fast_forward(stderr: &str) -> bool {
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("[rejected]")
}

/// A copy-pasteable script that reproduces and resolves the conflict.
pub fn resolution_script(workdir: &Path, target: &str, op: &str, files: &[String]) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!("cd {}\n", workdir.display()));
    script.push_str(&format!("git {op} {target}\n"));
    script.push_str("# resolve conflicts in:\n");
    for file in files {
        script.push_str(&format!("#   {file}\n"));
    }
    script.push_str("# then:\n");
    script.push_str("#   git add <files>\n");
    match op {
        "rebase" => script.push_str("#   git rebase --continue\n"),
        _ => script.push_str("#   git commit --no-edit\n"),
    }
    script
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
    use std::sync::Mutex as StdMutex;

    /// Replays a scripted sequence of outputs and records the argv of every
    /// call.
    struct ScriptedRunner {
        outputs: StdMutex<VecDeque<GitOutput>>,
        calls: StdMutex<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<GitOutput>) -> Self {
            Self {
                outputs: StdMutex::new(outputs.into()),
                calls: StdMutex::new(Vec::new()),
            }
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

    fn vcs(runner: ScriptedRunner) -> (Vcs, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (
            Vcs::new("/tmp/wt", runner.clone() as Arc<dyn GitRunner>),
            runner,
        )
    }

    #[test]
    fn protected_patterns() {
        let patterns: Vec<String> = vec![
            "main".into(),
            "master".into(),
            "develop".into(),
            "release/*".into(),
        ];
        assert!(is_protected("main", &patterns));
        assert!(is_protected("release/1.2", &patterns));
        assert!(!is_protected("release", &patterns));
        assert!(!is_protected("orc/task-001", &patterns));
        assert!(!is_protected("maintenance", &patterns));
    }

    #[test]
    fn checkpoint_message_format() {
        let msg = checkpoint_message(
            "[orc]",
            &TaskId::new(1),
            "implement",
            "completed",
            2,
            93,
            &["src/lib.rs".to_string(), "src/api.rs".to_string()],
        );
        assert!(msg.starts_with("[orc] TASK-001: implement - completed\n"));
        assert!(msg.contains("Iteration: 2"));
        assert!(msg.contains("Duration: 93s"));
        assert!(msg.contains("  - src/api.rs"));
    }

    #[test]
    fn resolution_script_mentions_files() {
        let script = resolution_script(
            Path::new("/w"),
            "main",
            "rebase",
            &["a.rs".to_string(), "b.rs".to_string()],
        );
        assert!(script.contains("git rebase main"));
        assert!(script.contains("#   a.rs"));
        assert!(script.contains("git rebase --continue"));
    }

    #[tokio::test]
    async fn checkpoint_with_nothing_staged_is_ok() {
        let (vcs, _) = vcs(ScriptedRunner::new(vec![
            GitOutput::ok(""), // add -A
            GitOutput::ok(""), // diff --cached (empty)
        ]));
        let info = vcs
            .checkpoint("[orc]", &TaskId::new(1), "implement", "completed", 1, 5)
            .await
            .unwrap();
        assert!(info.commit_id.is_none());
        assert!(info.files.is_empty());
    }

    #[tokio::test]
    async fn checkpoint_commits_staged_files() {
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![
            GitOutput::ok(""),                 // add -A
            GitOutput::ok("src/lib.rs\n"),     // diff --cached
            GitOutput::ok(""),                 // commit
            GitOutput::ok("abc123\n"),         // rev-parse HEAD
        ]));
        let info = vcs
            .checkpoint("[orc]", &TaskId::new(3), "test", "completed", 1, 10)
            .await
            .unwrap();
        assert_eq!(info.commit_id.as_deref(), Some("abc123"));
        assert_eq!(info.files, vec!["src/lib.rs"]);

        let calls = runner.calls();
        assert_eq!(calls[0], vec!["add", "-A", "--", ".", ":(exclude).orc"]);
        assert!(calls[2][2].contains("TASK-003: test - completed"));
    }

    #[tokio::test]
    async fn rebase_conflict_aborts_cleanly() {
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![
            GitOutput::err("CONFLICT (content): merge conflict"), // rebase
            GitOutput::ok("src/a.rs\nsrc/b.rs\n"),                // diff -U
            GitOutput::ok(""),                                    // rebase --abort
        ]));
        let outcome = vcs.sync("main", SyncMode::Rebase).await.unwrap();
        match outcome {
            SyncOutcome::Conflicts { files, resolution_script } => {
                assert_eq!(files, vec!["src/a.rs", "src/b.rs"]);
                assert!(resolution_script.contains("git rebase main"));
            }
            other => panic!("expected conflicts, got {other:?}"),
        }
        let calls = runner.calls();
        assert_eq!(calls[2], vec!["rebase", "--abort"]);
    }

    #[tokio::test]
    async fn detect_does_not_leave_merge_state() {
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![
            GitOutput::err("CONFLICT"),   // merge --no-commit
            GitOutput::ok("src/a.rs\n"),  // diff -U
            GitOutput::ok(""),            // merge --abort
        ]));
        let outcome = vcs.sync("main", SyncMode::Detect).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Conflicts { .. }));
        let calls = runner.calls();
        assert_eq!(calls.last().unwrap(), &vec!["merge", "--abort"]);
    }

    #[tokio::test]
    async fn push_retries_with_lease_once() {
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![
            GitOutput::err("! [rejected] non-fast-forward"),
            GitOutput::ok(""),
        ]));
        let outcome = vcs.push("orc/task-001", &[]).await.unwrap();
        assert_eq!(outcome, PushOutcome::ForcedWithLease);
        let calls = runner.calls();
        assert_eq!(calls[1][..2], ["push".to_string(), "--force-with-lease".to_string()]);
    }

    #[tokio::test]
    async fn push_never_forces_protected_branch() {
        let protected = vec!["main".to_string()];
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![GitOutput::err(
            "! [rejected] non-fast-forward",
        )]));
        let err = vcs.push("main", &protected).await.unwrap_err();
        assert!(matches!(err, VcsError::ProtectedBranch(b) if b == "main"));
        // Only the initial (lease-free) push ran; no force command followed.
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn force_push_refused_before_any_git_command() {
        let protected = vec!["main".to_string()];
        let (vcs, runner) = vcs(ScriptedRunner::new(vec![]));
        let err = vcs.force_push("main", &protected).await.unwrap_err();
        assert!(matches!(err, VcsError::ProtectedBranch(_)));
        assert!(runner.calls().is_empty());
    }
}
