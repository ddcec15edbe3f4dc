//! Per-worktree PID guard.
//!
//! A file named `.orc/pid` inside the worktree records which executor
//! process owns the task. This is the only cross-invocation mutual
//! exclusion the engine relies on: two executors for the *same* task and
//! tag would share a worktree, so exactly one may hold the guard. Different
//! users or tags get different worktrees and never contend.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` so two racing executors have exactly
//! one winner; the loser sees `AlreadyExists` and checks whether the holder
//! is alive.
//!
//! ## Stale guard recovery
//!
//! `check()` probes the recorded PID via `kill(pid, 0)`. A dead holder
//! (crash, SIGKILL) leaves a stale file that is removed automatically.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Relative path of the guard file inside a worktree.
pub const PID_FILE: &str = ".orc/pid";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PidGuardError {
    #[error("task already running (pid={pid}, host={hostname})")]
    AlreadyRunning { pid: u32, hostname: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// PidGuard
// ---------------------------------------------------------------------------

/// Contents of the guard file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// What `check()` observed in a worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardStatus {
    /// A live process owns this worktree.
    Running(u32),
    /// No guard file, or a stale one that was cleaned up.
    Free,
}

pub struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    /// Guard for the given worktree directory.
    pub fn for_worktree(worktree: impl AsRef<Path>) -> Self {
        Self {
            path: worktree.as_ref().join(PID_FILE),
        }
    }

    /// Inspect the guard. A stale file (dead PID, or unparseable) is removed
    /// and reported as `Free`.
    pub fn check(&self) -> GuardStatus {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return GuardStatus::Free;
        };
        match serde_json::from_str::<GuardInfo>(&content) {
            Ok(info) if pid_alive(info.pid) => GuardStatus::Running(info.pid),
            Ok(info) => {
                tracing::info!(pid = info.pid, path = %self.path.display(), "removing stale pid guard");
                let _ = std::fs::remove_file(&self.path);
                GuardStatus::Free
            }
            Err(_) => {
                tracing::warn!(path = %self.path.display(), "removing unparseable pid guard");
                let _ = std::fs::remove_file(&self.path);
                GuardStatus::Free
            }
        }
    }

    /// Write the current process id into the guard, refusing if a live
    /// process already holds it. One retry after stale cleanup.
    pub fn acquire(&self) -> Result<GuardInfo, PidGuardError> {
        for attempt in 0..2 {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let info = GuardInfo {
                pid: std::process::id(),
                hostname: hostname(),
                acquired_at: Utc::now(),
            };

            match OpenOptions::new()
                .write(true)
                .create_new(true) // O_CREAT | O_EXCL
                .open(&self.path)
            {
                Ok(mut file) => {
                    let json = serde_json::to_string_pretty(&info)
                        .expect("guard info serializes");
                    file.write_all(json.as_bytes())?;
                    file.sync_all()?;
                    return Ok(info);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    match self.check() {
                        GuardStatus::Running(pid) => {
                            let holder = std::fs::read_to_string(&self.path)
                                .ok()
                                .and_then(|c| serde_json::from_str::<GuardInfo>(&c).ok());
                            return Err(PidGuardError::AlreadyRunning {
                                pid,
                                hostname: holder
                                    .map(|h| h.hostname)
                                    .unwrap_or_else(|| "unknown".into()),
                            });
                        }
                        GuardStatus::Free if attempt == 0 => continue,
                        GuardStatus::Free => {
                            return Err(PidGuardError::Io(std::io::Error::other(
                                "guard acquire failed after stale cleanup",
                            )))
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("acquire loop always returns")
    }

    /// Remove the guard file. Idempotent.
    pub fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    // Assume alive on non-Unix; avoids accidental cleanup.
    true
}

/// Best-effort local hostname.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "localhost".into())
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn acquire_then_check_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::for_worktree(dir.path());

        assert_eq!(guard.check(), GuardStatus::Free);
        let info = guard.acquire().unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(guard.check(), GuardStatus::Running(std::process::id()));

        guard.release();
        assert_eq!(guard.check(), GuardStatus::Free);
    }

    #[test]
    fn second_acquire_refused_while_alive() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::for_worktree(dir.path());
        guard.acquire().unwrap();

        let err = guard.acquire().unwrap_err();
        assert!(matches!(err, PidGuardError::AlreadyRunning { .. }));
        guard.release();
    }

    #[test]
    fn stale_guard_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::for_worktree(dir.path());

        // Plant a guard for a process that cannot exist.
        std::fs::create_dir_all(dir.path().join(".orc")).unwrap();
        let stale = GuardInfo {
            pid: 4_000_000,
            hostname: "ghost".into(),
            acquired_at: Utc::now(),
        };
        std::fs::write(
            guard.path(),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        assert_eq!(guard.check(), GuardStatus::Free);
        assert!(!guard.path().exists());

        // And a fresh acquire succeeds over a stale file.
        std::fs::write(guard.path(), serde_json::to_string(&stale).unwrap()).unwrap();
        assert!(guard.acquire().is_ok());
        guard.release();
    }

    #[test]
    fn unparseable_guard_is_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PidGuard::for_worktree(dir.path());
        std::fs::create_dir_all(dir.path().join(".orc")).unwrap();
        std::fs::write(guard.path(), "not json").unwrap();
        assert_eq!(guard.check(), GuardStatus::Free);
    }
}
