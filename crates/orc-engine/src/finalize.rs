//! The finalize flow: sync with the target branch, push, hand the PR to
//! the hosting platform, and merge server-side.
//!
//! Merging never happens through a local checkout of the target branch —
//! only through the provider API — so finalize cannot collide with other
//! worktrees.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use orc_core::config::EffectiveConfig;
use orc_core::types::Task;
use orc_events::{Event, EventBus};
use orc_host::{checks_green, checks_pending, HostingProvider, PrSpec, PullRequest};
use orc_vcs::{SyncMode, SyncOutcome, Vcs};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("sync with {target} conflicted in {files:?}")]
    SyncConflict {
        target: String,
        files: Vec<String>,
        resolution_script: String,
    },

    #[error("vcs error: {0}")]
    Vcs(#[from] orc_vcs::VcsError),

    #[error("hosting error: {0}")]
    Host(#[from] orc_host::HostError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    pub pr: Option<PullRequest>,
    pub merged: bool,
    pub branch_deleted: bool,
}

/// How long to poll for checks before giving up, and how often.
const CHECKS_POLL_INTERVAL: Duration = Duration::from_secs(30);
const CHECKS_POLL_LIMIT: u32 = 60;

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

pub async fn run_finalize(
    task: &Task,
    branch: &str,
    config: &EffectiveConfig,
    vcs: &Vcs,
    host: Option<&Arc<dyn HostingProvider>>,
    bus: &EventBus,
) -> Result<FinalizeOutcome, FinalizeError> {
    let target = &config.target_branch;
    let progress = |step: &str| {
        bus.publish(Event::for_task(
            "finalize_progress",
            &task.id,
            serde_json::json!({ "step": step }),
        ));
    };

    // 1. Bring the branch up to date with the target (merge, not rebase,
    //    so pushed history is stable).
    progress("sync");
    if let Err(e) = vcs.fetch("origin").await {
        warn!(error = %e, "fetch failed; syncing against local target");
    }
    match vcs.sync(target, SyncMode::Merge).await? {
        SyncOutcome::Clean => {}
        SyncOutcome::Conflicts {
            files,
            resolution_script,
        } => {
            // The one conflict class we resolve mechanically: append-only
            // knowledge rows in CLAUDE.md.
            if files == ["CLAUDE.md"] {
                info!("retrying sync with knowledge auto-merge");
                if !try_knowledge_merge(vcs, target).await? {
                    return Err(FinalizeError::SyncConflict {
                        target: target.clone(),
                        files,
                        resolution_script,
                    });
                }
            } else {
                return Err(FinalizeError::SyncConflict {
                    target: target.clone(),
                    files,
                    resolution_script,
                });
            }
        }
    }

    // 2. Push, with a lease-guarded force only if the branch diverged.
    progress("push");
    vcs.push(branch, &config.protected_branches).await?;

    let Some(host) = host else {
        info!("no hosting provider configured; finalize stops after push");
        return Ok(FinalizeOutcome::default());
    };
    if !config.finalize.create_pr {
        return Ok(FinalizeOutcome::default());
    }

    // 3. Create or update the PR.
    progress("pull_request");
    let title = format!("{} {}", config.finalize.pr_title_prefix, task.title);
    let body = pr_body(task);
    let pr = match host.find_open_pr(branch).await? {
        Some(existing) => {
            host.update_pr(existing.number, Some(&title), Some(&body))
                .await?
        }
        None => {
            host.create_pr(&PrSpec {
                title,
                body,
                head: branch.to_string(),
                base: target.clone(),
                draft: false,
            })
            .await?
        }
    };

    host.request_reviews(pr.number, &config.finalize.reviewers).await?;
    host.add_assignees(pr.number, &config.finalize.assignees).await?;
    host.add_labels(pr.number, &config.finalize.labels).await?;

    // 4. Optionally wait for checks, then merge server-side.
    let mut outcome = FinalizeOutcome {
        pr: Some(pr.clone()),
        merged: false,
        branch_deleted: false,
    };

    if config.ci.wait_for_checks {
        progress("checks");
        let mut polls = 0;
        loop {
            let checks = host.get_checks(pr.number).await?;
            if !checks_pending(&checks) {
                if !checks_green(&checks) {
                    warn!(number = pr.number, "checks failed; leaving PR open");
                    return Ok(outcome);
                }
                break;
            }
            polls += 1;
            if polls >= CHECKS_POLL_LIMIT {
                warn!(number = pr.number, "checks still pending; leaving PR open");
                return Ok(outcome);
            }
            tokio::time::sleep(CHECKS_POLL_INTERVAL).await;
        }
    }

    if config.ci.auto_merge {
        progress("merge");
        host.merge(pr.number, config.ci.merge_method, pr.head_sha.as_deref())
            .await?;
        outcome.merged = true;

        if config.ci.delete_branch {
            progress("delete_branch");
            host.delete_branch(branch).await?;
            vcs.delete_local_branch(branch).await.ok();
            outcome.branch_deleted = true;
        }
    }

    progress("done");
    Ok(outcome)
}

/// Re-run the merge leaving conflicts in place, attempt the append-only
/// table merge, and commit when it resolves everything.
async fn try_knowledge_merge(vcs: &Vcs, target: &str) -> Result<bool, FinalizeError> {
    if vcs.begin_merge(target).await? {
        // The retry merged cleanly (e.g. the other side moved); done.
        return Ok(true);
    }
    if vcs.auto_merge_knowledge("CLAUDE.md").await? && vcs.conflicted_files().await?.is_empty() {
        vcs.commit_merge().await?;
        return Ok(true);
    }
    vcs.abort_merge().await?;
    Ok(false)
}

fn pr_body(task: &Task) -> String {
    let mut body = String::new();
    if let Some(description) = &task.description {
        body.push_str(description);
        body.push_str("\n\n");
    }
    body.push_str(&format!("---\nTask: {}\nWeight: {}\n", task.id, task.weight));
    body
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orc_core::id::TaskId;
    use orc_core::types::TaskWeight;

    #[test]
    fn pr_body_carries_task_metadata() {
        let mut task = Task::new(TaskId::new(12), "proj", "ship it", TaskWeight::Medium);
        task.description = Some("Adds the shipping module.".into());
        let body = pr_body(&task);
        assert!(body.contains("Adds the shipping module."));
        assert!(body.contains("Task: TASK-012"));
        assert!(body.contains("Weight: medium"));
    }
}
