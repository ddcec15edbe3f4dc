//! Crash recovery.
//!
//! A worktree that exists without a live PID means a previous executor
//! died mid-task. Re-entry inspects the persisted state and the worktree,
//! then applies one of three policies: resume from the last checkpoint,
//! just report (for a human to look at), or clean and restart.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orc_core::id::TaskId;
use orc_core::types::{PhaseState, PhaseStatus};
use orc_store::Store;
use orc_vcs::Vcs;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Restore the worktree to the last committed checkpoint and replay
    /// from there.
    ResumeFromCheckpoint,
    /// Touch nothing; surface the report and stop.
    Inspect,
    /// Discard everything uncommitted and reset phase bookkeeping so the
    /// task starts its current phase over.
    CleanRestart,
}

/// What re-entry found in the dead executor's wake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub task_id: TaskId,
    /// The phase that was running when the executor died, if any.
    pub phase: Option<String>,
    pub iteration: u32,
    pub last_checkpoint: Option<String>,
    pub dirty_files: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("store error: {0}")]
    Store(#[from] orc_store::StoreError),

    #[error("vcs error: {0}")]
    Vcs(#[from] orc_vcs::VcsError),
}

// ---------------------------------------------------------------------------
// Inspection and repair
// ---------------------------------------------------------------------------

pub async fn inspect(
    store: &Arc<Store>,
    vcs: &Vcs,
    task_id: &TaskId,
) -> Result<RecoveryReport, RecoveryError> {
    let states = store.load_phase_states(task_id).await?;
    let running: Option<&PhaseState> = states
        .values()
        .find(|s| s.status == PhaseStatus::Running);

    // The newest checkpoint across all phases is the consistent point to
    // fall back to.
    let last_checkpoint = states
        .values()
        .filter_map(|s| {
            s.last_checkpoint
                .as_ref()
                .map(|c| (s.completed_at.or(s.started_at), c.clone()))
        })
        .max_by_key(|(at, _)| *at)
        .map(|(_, c)| c);

    let dirty_files = vcs.changed_paths().await?;

    Ok(RecoveryReport {
        task_id: task_id.clone(),
        phase: running.map(|s| s.phase.clone()),
        iteration: running.map(|s| s.iterations).unwrap_or(0),
        last_checkpoint,
        dirty_files,
    })
}

/// Apply a recovery policy. Returns `true` when execution may proceed.
pub async fn apply(
    policy: RecoveryPolicy,
    report: &RecoveryReport,
    store: &Arc<Store>,
    vcs: &Vcs,
) -> Result<bool, RecoveryError> {
    match policy {
        RecoveryPolicy::Inspect => {
            info!(task_id = %report.task_id, phase = ?report.phase, "recovery inspection only");
            Ok(false)
        }

        RecoveryPolicy::ResumeFromCheckpoint => {
            vcs.repair().await?;
            if !report.dirty_files.is_empty() {
                match &report.last_checkpoint {
                    Some(commit) => {
                        warn!(
                            task_id = %report.task_id,
                            commit = %commit,
                            dirty = report.dirty_files.len(),
                            "discarding uncommitted work; rewinding to checkpoint"
                        );
                        vcs.rewind(commit).await?;
                    }
                    None => {
                        // Nothing was ever committed; dropping the partial
                        // iteration is the consistent restart point.
                        vcs.discard_changes().await?;
                    }
                }
            }
            // The interrupted phase replays from its checkpoint.
            if let Some(phase) = &report.phase {
                let mut states = store.load_phase_states(&report.task_id).await?;
                if let Some(state) = states.get_mut(phase) {
                    state.reset_for_retry();
                    store.save_phase_state(&report.task_id, state).await?;
                }
            }
            Ok(true)
        }

        RecoveryPolicy::CleanRestart => {
            vcs.repair().await?;
            vcs.discard_changes().await?;
            let mut states = store.load_phase_states(&report.task_id).await?;
            for state in states.values_mut() {
                if state.status == PhaseStatus::Running {
                    *state = PhaseState::new(&state.phase);
                    store.save_phase_state(&report.task_id, state).await?;
                }
            }
            info!(task_id = %report.task_id, "worktree cleaned; phase restarts fresh");
            Ok(true)
        }
    }
}

/// True when the directory looks like an abandoned worktree (exists, no
/// live owner).
pub fn is_abandoned(worktree: &Path) -> bool {
    use orc_core::pid_guard::{GuardStatus, PidGuard};
    worktree.exists()
        && matches!(PidGuard::for_worktree(worktree).check(), GuardStatus::Free)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
