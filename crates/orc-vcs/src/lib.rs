//! Version-control adapter for orc.
//!
//! Tasks execute in per-task git worktrees under `.orc/worktrees/`. Write
//! operations shell out to the `git` binary through a mockable
//! [`runner::GitRunner`]; read-only queries use libgit2 when the `libgit2`
//! feature is enabled. Compound operations (stage+commit, rebase+diff+abort,
//! merge+diff+abort) are serialized by a per-instance mutex; single commands
//! are inherently atomic.

pub mod automerge;
pub mod ops;
pub mod runner;
pub mod worktrees;

#[cfg(feature = "libgit2")]
pub mod git2_read;

pub use ops::{CheckpointInfo, PushOutcome, SyncMode, SyncOutcome, Vcs, VcsError};
pub use runner::{GitOutput, GitRunner, RealGitRunner};
pub use worktrees::{WorktreeError, WorktreeHandle, WorktreeManager, WorktreeStatus};
