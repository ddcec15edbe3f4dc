use async_trait::async_trait;
use octocrab::Octocrab;
use tracing::{debug, info};

use orc_core::config::MergeMethod;

use crate::{CheckRun, CheckStatus, HostError, HostingProvider, PrSpec, PullRequest, Result};

// ---------------------------------------------------------------------------
// GithubProvider
// ---------------------------------------------------------------------------

pub struct GithubProvider {
    octocrab: Octocrab,
    owner: String,
    repo: String,
}

impl GithubProvider {
    pub fn new(token: impl Into<String>, owner: impl Into<String>, repo: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(HostError::MissingToken);
        }
        let octocrab = Octocrab::builder().personal_token(token).build()?;
        Ok(Self {
            octocrab,
            owner: owner.into(),
            repo: repo.into(),
        })
    }

    fn repo_route(&self, tail: &str) -> String {
        format!("/repos/{}/{}/{tail}", self.owner, self.repo)
    }

    fn convert(pr: octocrab::models::pulls::PullRequest) -> PullRequest {
        PullRequest {
            number: pr.number,
            url: pr
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_default(),
            head_sha: Some(pr.head.sha),
            state: pr
                .state
                .map(|s| format!("{s:?}").to_lowercase())
                .unwrap_or_else(|| "open".into()),
        }
    }
}

fn merge_method_str(method: MergeMethod) -> &'static str {
    match method {
        MergeMethod::Squash => "squash",
        MergeMethod::Merge => "merge",
        MergeMethod::Rebase => "rebase",
    }
}

/// Map a check-run `status`/`conclusion` pair onto the neutral status.
fn map_check(status: &str, conclusion: Option<&str>) -> CheckStatus {
    match (status, conclusion) {
        (_, Some("success")) => CheckStatus::Pass,
        (_, Some("failure")) | (_, Some("timed_out")) | (_, Some("action_required")) => {
            CheckStatus::Fail
        }
        (_, Some("skipped")) | (_, Some("neutral")) => CheckStatus::Skipped,
        (_, Some("cancelled")) => CheckStatus::Cancelled,
        ("completed", _) => CheckStatus::Fail,
        _ => CheckStatus::Pending,
    }
}

#[async_trait]
impl HostingProvider for GithubProvider {
    async fn create_pr(&self, spec: &PrSpec) -> Result<PullRequest> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .create(&spec.title, &spec.head, &spec.base)
            .body(&spec.body)
            .draft(spec.draft)
            .send()
            .await?;
        info!(number = pr.number, "created pull request");
        Ok(Self::convert(pr))
    }

    async fn update_pr(
        &self,
        number: u64,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<PullRequest> {
        let handler = self.octocrab.pulls(&self.owner, &self.repo);
        let mut update = handler.update(number);
        if let Some(title) = title {
            update = update.title(title);
        }
        if let Some(body) = body {
            update = update.body(body);
        }
        let pr = update.send().await?;
        Ok(Self::convert(pr))
    }

    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>> {
        let page = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .head(format!("{}:{}", self.owner, head))
            .send()
            .await?;
        Ok(page.items.into_iter().next().map(Self::convert))
    }

    async fn request_reviews(&self, number: u64, reviewers: &[String]) -> Result<()> {
        if reviewers.is_empty() {
            return Ok(());
        }
        let route = self.repo_route(&format!("pulls/{number}/requested_reviewers"));
        let body = serde_json::json!({ "reviewers": reviewers });
        let _: serde_json::Value = self.octocrab.post(route, Some(&body)).await?;
        Ok(())
    }

    async fn add_assignees(&self, number: u64, assignees: &[String]) -> Result<()> {
        if assignees.is_empty() {
            return Ok(());
        }
        let route = self.repo_route(&format!("issues/{number}/assignees"));
        let body = serde_json::json!({ "assignees": assignees });
        let _: serde_json::Value = self.octocrab.post(route, Some(&body)).await?;
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        // Only attach labels that exist; missing ones are skipped silently.
        let existing: serde_json::Value = self
            .octocrab
            .get(self.repo_route("labels?per_page=100"), None::<&()>)
            .await?;
        let known: Vec<String> = existing
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|l| l.get("name").and_then(|n| n.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let to_add: Vec<&String> = labels.iter().filter(|l| known.contains(l)).collect();
        for skipped in labels.iter().filter(|l| !known.contains(l)) {
            debug!(label = %skipped, "label does not exist; skipping");
        }
        if to_add.is_empty() {
            return Ok(());
        }

        let route = self.repo_route(&format!("issues/{number}/labels"));
        let body = serde_json::json!({ "labels": to_add });
        let _: serde_json::Value = self.octocrab.post(route, Some(&body)).await?;
        Ok(())
    }

    async fn get_checks(&self, number: u64) -> Result<Vec<CheckRun>> {
        let pr = self
            .octocrab
            .pulls(&self.owner, &self.repo)
            .get(number)
            .await?;
        let sha = pr.head.sha;

        let response: serde_json::Value = self
            .octocrab
            .get(
                self.repo_route(&format!("commits/{sha}/check-runs")),
                None::<&()>,
            )
            .await?;

        let runs = response
            .get("check_runs")
            .and_then(|r| r.as_array())
            .map(|arr| {
                arr.iter()
                    .map(|run| CheckRun {
                        name: run
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("check")
                            .to_string(),
                        status: map_check(
                            run.get("status").and_then(|s| s.as_str()).unwrap_or(""),
                            run.get("conclusion").and_then(|c| c.as_str()),
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(runs)
    }

    async fn merge(
        &self,
        number: u64,
        method: MergeMethod,
        expected_head_sha: Option<&str>,
    ) -> Result<()> {
        let route = self.repo_route(&format!("pulls/{number}/merge"));
        let mut body = serde_json::json!({ "merge_method": merge_method_str(method) });
        if let Some(sha) = expected_head_sha {
            body["sha"] = serde_json::json!(sha);
        }
        let _: serde_json::Value = self.octocrab.put(route, Some(&body)).await?;
        info!(number = number, method = merge_method_str(method), "merged server-side");
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        let route = self.repo_route(&format!("git/refs/heads/{branch}"));
        self.octocrab._delete(route, None::<&()>).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_refused() {
        assert!(matches!(
            GithubProvider::new("", "acme", "widgets"),
            Err(HostError::MissingToken)
        ));
    }

    #[test]
    fn check_mapping() {
        assert_eq!(map_check("completed", Some("success")), CheckStatus::Pass);
        assert_eq!(map_check("completed", Some("failure")), CheckStatus::Fail);
        assert_eq!(map_check("completed", Some("skipped")), CheckStatus::Skipped);
        assert_eq!(map_check("completed", Some("cancelled")), CheckStatus::Cancelled);
        assert_eq!(map_check("in_progress", None), CheckStatus::Pending);
        assert_eq!(map_check("queued", None), CheckStatus::Pending);
        // Completed without a recognised conclusion is a failure, not green.
        assert_eq!(map_check("completed", Some("weird")), CheckStatus::Fail);
    }

    #[test]
    fn merge_method_names() {
        assert_eq!(merge_method_str(MergeMethod::Squash), "squash");
        assert_eq!(merge_method_str(MergeMethod::Merge), "merge");
        assert_eq!(merge_method_str(MergeMethod::Rebase), "rebase");
    }
}
