//! Native git read operations via libgit2.
//!
//! Read-only queries (status, current branch) run in-process; write
//! operations stay as shell-outs through [`crate::runner::GitRunner`].
//! Feature gated: with `libgit2` disabled everything falls back to the
//! shell-out path.

use std::path::Path;

/// Stateless read ops — opens the repo fresh per call, which avoids stale
/// index issues and costs well under a millisecond for local repos.
pub struct Git2Read;

impl Git2Read {
    fn open(workdir: &Path) -> Result<git2::Repository, String> {
        git2::Repository::discover(workdir).map_err(|e| e.message().to_string())
    }

    /// Current branch name (short OID when detached).
    pub fn current_branch(workdir: &Path) -> Result<String, String> {
        let repo = Self::open(workdir)?;
        let head = repo.head().map_err(|e| e.message().to_string())?;
        if head.is_branch() {
            Ok(head.shorthand().unwrap_or("HEAD").to_string())
        } else {
            let oid = head
                .target()
                .ok_or_else(|| "HEAD has no target".to_string())?;
            Ok(format!("{:.7}", oid))
        }
    }

    /// Paths that differ from HEAD, untracked files included.
    pub fn changed_paths(workdir: &Path) -> Result<Vec<String>, String> {
        let repo = Self::open(workdir)?;
        let mut opts = git2::StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = repo
            .statuses(Some(&mut opts))
            .map_err(|e| e.message().to_string())?;

        Ok(statuses
            .iter()
            .filter_map(|entry| entry.path().map(String::from))
            .collect())
    }

    pub fn is_clean(workdir: &Path) -> Result<bool, String> {
        Ok(Self::changed_paths(workdir)?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "t@example.com"],
            vec!["config", "user.name", "t"],
        ] {
            Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .expect("git available");
        }
    }

    #[test]
    fn detects_untracked_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        assert!(Git2Read::is_clean(dir.path()).unwrap());

        std::fs::write(dir.path().join("new.txt"), "hello").unwrap();
        let paths = Git2Read::changed_paths(dir.path()).unwrap();
        assert_eq!(paths, vec!["new.txt"]);
        assert!(!Git2Read::is_clean(dir.path()).unwrap());
    }

    #[test]
    fn open_fails_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Git2Read::current_branch(dir.path()).is_err());
    }
}
