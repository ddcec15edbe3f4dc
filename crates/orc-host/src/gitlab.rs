use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use orc_core::config::MergeMethod;

use crate::{CheckRun, CheckStatus, HostError, HostingProvider, PrSpec, PullRequest, Result};

// ---------------------------------------------------------------------------
// GitlabProvider
// ---------------------------------------------------------------------------

/// GitLab REST implementation. Merge requests map onto the neutral
/// [`PullRequest`] type; pipelines map onto checks.
pub struct GitlabProvider {
    base_url: String,
    token: String,
    /// URL-encoded `group/project` path.
    project: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MergeRequestPayload {
    iid: u64,
    web_url: String,
    sha: Option<String>,
    state: String,
}

#[derive(Debug, Deserialize)]
struct PipelinePayload {
    #[serde(default)]
    name: Option<String>,
    status: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    id: u64,
}

impl GitlabProvider {
    pub fn new(
        token: impl Into<String>,
        project_path: impl AsRef<str>,
    ) -> Result<Self> {
        Self::with_base_url("https://gitlab.com", token, project_path)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        token: impl Into<String>,
        project_path: impl AsRef<str>,
    ) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(HostError::MissingToken);
        }
        Ok(Self {
            base_url: base_url.into(),
            token,
            project: encode_project_path(project_path.as_ref()),
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/api/v4/projects/{}/{tail}", self.base_url, self.project)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("PRIVATE-TOKEN", &self.token)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::Api(format!("{status}: {body}")));
        }
        Ok(response.json().await?)
    }

    fn convert(mr: MergeRequestPayload) -> PullRequest {
        PullRequest {
            number: mr.iid,
            url: mr.web_url,
            head_sha: mr.sha,
            state: mr.state,
        }
    }

    /// Resolve usernames to ids, silently skipping unknown users.
    async fn user_ids(&self, usernames: &[String]) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        for username in usernames {
            let url = format!("{}/api/v4/users?username={username}", self.base_url);
            let users: Vec<UserPayload> =
                self.send(self.request(reqwest::Method::GET, url)).await?;
            match users.first() {
                Some(user) => ids.push(user.id),
                None => debug!(username = %username, "unknown user; skipping"),
            }
        }
        Ok(ids)
    }
}

fn encode_project_path(path: &str) -> String {
    path.replace('/', "%2F")
}

fn map_pipeline_status(status: &str) -> CheckStatus {
    match status {
        "success" => CheckStatus::Pass,
        "failed" => CheckStatus::Fail,
        "canceled" | "cancelled" => CheckStatus::Cancelled,
        "skipped" | "manual" => CheckStatus::Skipped,
        _ => CheckStatus::Pending,
    }
}

#[async_trait]
impl HostingProvider for GitlabProvider {
    async fn create_pr(&self, spec: &PrSpec) -> Result<PullRequest> {
        let body = serde_json::json!({
            "source_branch": spec.head,
            "target_branch": spec.base,
            "title": if spec.draft { format!("Draft: {}", spec.title) } else { spec.title.clone() },
            "description": spec.body,
        });
        let mr: MergeRequestPayload = self
            .send(
                self.request(reqwest::Method::POST, self.url("merge_requests"))
                    .json(&body),
            )
            .await?;
        info!(iid = mr.iid, "created merge request");
        Ok(Self::convert(mr))
    }

    async fn update_pr(
        &self,
        number: u64,
        title: Option<&str>,
        body: Option<&str>,
    ) -> Result<PullRequest> {
        let mut payload = serde_json::Map::new();
        if let Some(title) = title {
            payload.insert("title".into(), title.into());
        }
        if let Some(body) = body {
            payload.insert("description".into(), body.into());
        }
        let mr: MergeRequestPayload = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("merge_requests/{number}")),
                )
                .json(&payload),
            )
            .await?;
        Ok(Self::convert(mr))
    }

    async fn find_open_pr(&self, head: &str) -> Result<Option<PullRequest>> {
        let url = self.url(&format!(
            "merge_requests?state=opened&source_branch={head}"
        ));
        let mrs: Vec<MergeRequestPayload> =
            self.send(self.request(reqwest::Method::GET, url)).await?;
        Ok(mrs.into_iter().next().map(Self::convert))
    }

    async fn request_reviews(&self, number: u64, reviewers: &[String]) -> Result<()> {
        if reviewers.is_empty() {
            return Ok(());
        }
        let ids = self.user_ids(reviewers).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "reviewer_ids": ids });
        let _: serde_json::Value = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("merge_requests/{number}")),
                )
                .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn add_assignees(&self, number: u64, assignees: &[String]) -> Result<()> {
        if assignees.is_empty() {
            return Ok(());
        }
        let ids = self.user_ids(assignees).await?;
        if ids.is_empty() {
            return Ok(());
        }
        let body = serde_json::json!({ "assignee_ids": ids });
        let _: serde_json::Value = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("merge_requests/{number}")),
                )
                .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        if labels.is_empty() {
            return Ok(());
        }
        // GitLab creates unknown labels on the fly when adding them to an
        // MR, so "missing" labels cannot fail here; pass them through.
        let body = serde_json::json!({ "add_labels": labels.join(",") });
        let _: serde_json::Value = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("merge_requests/{number}")),
                )
                .json(&body),
            )
            .await?;
        Ok(())
    }

    async fn get_checks(&self, number: u64) -> Result<Vec<CheckRun>> {
        let url = self.url(&format!("merge_requests/{number}/pipelines"));
        let pipelines: Vec<PipelinePayload> =
            self.send(self.request(reqwest::Method::GET, url)).await?;
        Ok(pipelines
            .into_iter()
            .map(|p| CheckRun {
                name: p.name.unwrap_or_else(|| "pipeline".into()),
                status: map_pipeline_status(&p.status),
            })
            .collect())
    }

    async fn merge(
        &self,
        number: u64,
        method: MergeMethod,
        expected_head_sha: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "squash": matches!(method, MergeMethod::Squash),
        });
        if let Some(sha) = expected_head_sha {
            body["sha"] = serde_json::json!(sha);
        }
        let _: serde_json::Value = self
            .send(
                self.request(
                    reqwest::Method::PUT,
                    self.url(&format!("merge_requests/{number}/merge")),
                )
                .json(&body),
            )
            .await?;
        info!(iid = number, "merged server-side");
        Ok(())
    }

    async fn delete_branch(&self, branch: &str) -> Result<()> {
        let url = self.url(&format!("repository/branches/{}", encode_project_path(branch)));
        let response = self.request(reqwest::Method::DELETE, url).send().await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(HostError::Api(format!(
                "branch delete failed: {}",
                response.status()
            )));
        }
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
    fn project_paths_are_encoded() {
        assert_eq!(encode_project_path("acme/widgets"), "acme%2Fwidgets");
        assert_eq!(encode_project_path("group/sub/proj"), "group%2Fsub%2Fproj");
    }

    #[test]
    fn pipeline_status_mapping() {
        assert_eq!(map_pipeline_status("success"), CheckStatus::Pass);
        assert_eq!(map_pipeline_status("failed"), CheckStatus::Fail);
        assert_eq!(map_pipeline_status("canceled"), CheckStatus::Cancelled);
        assert_eq!(map_pipeline_status("skipped"), CheckStatus::Skipped);
        assert_eq!(map_pipeline_status("running"), CheckStatus::Pending);
        assert_eq!(map_pipeline_status("created"), CheckStatus::Pending);
    }

    #[test]
    fn urls_use_encoded_project() {
        let provider = GitlabProvider::new("tok", "acme/widgets").unwrap();
        assert_eq!(
            provider.url("merge_requests"),
            "https://gitlab.com/api/v4/projects/acme%2Fwidgets/merge_requests"
        );
    }

    #[test]
    fn empty_token_refused() {
        assert!(matches!(
            GitlabProvider::new("", "a/b"),
            Err(HostError::MissingToken)
        ));
    }
}
