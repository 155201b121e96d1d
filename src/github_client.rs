use std::fmt;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Response, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum::Display;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    app_token::AppToken,
    check_run::{CheckRunState, Conclusion, JobStatus},
    events::GithubRepository,
    github_config::GithubApiConfig,
    github_token::InstallationToken,
};

const GITHUB_API_VERSION: &str = "2022-11-28";
const OUR_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const MAX_TEXT_LENGTH: usize = 65535;

/// GitHub REST surface the app depends on.
/// Transport, retry and rate limits are the implementation's business, not the caller's.
#[allow(clippy::indexing_slicing)] // For automock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn get_app_metadata(&self, app_token: &AppToken) -> Result<AppMetadata>;

    async fn exchange_installation_token(
        &self,
        app_token: &AppToken,
        installation_id: i64,
    ) -> Result<InstallationTokenGrant>;

    async fn create_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        input: &CreateCheckRun,
    ) -> Result<RemoteCheckRun>;

    async fn update_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
        input: &UpdateCheckRun,
    ) -> Result<RemoteCheckRun>;

    async fn get_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
    ) -> Result<RemoteCheckRun>;

    /// Latest check runs named `check_name` for a commit, newest first.
    async fn list_check_runs_for_ref(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        git_ref: &str,
        check_name: &str,
    ) -> Result<Vec<RemoteCheckRun>>;

    async fn rerequest_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
    ) -> Result<()>;

    async fn create_commit_status(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        sha: &str,
        input: &CreateCommitStatus,
    ) -> Result<()>;

    async fn create_issue_comment(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        issue_number: u64,
        body: &str,
    ) -> Result<()>;
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("unauthorized request to GitHub")]
    Unauthorized,
    #[error("GitHub rate limit exceeded")]
    RateLimited,
    #[error("forbidden request to GitHub")]
    Forbidden,
    #[error("GitHub API error: status={status}, body={body}")]
    Api { status: StatusCode, body: String },
}

fn map_github_error(status: StatusCode, body: String) -> UpstreamError {
    match status {
        StatusCode::UNAUTHORIZED => UpstreamError::Unauthorized,
        StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
            if body.to_lowercase().contains("rate limit") =>
        {
            UpstreamError::RateLimited
        }
        StatusCode::FORBIDDEN => UpstreamError::Forbidden,
        _ => UpstreamError::Api { status, body },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub id: i64,
    #[serde(default)]
    pub slug: Option<String>,
    pub name: String,
}

#[derive(Clone, Deserialize)]
pub struct InstallationTokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for InstallationTokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstallationTokenGrant")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateCheckRun {
    pub name: String,
    pub head_sha: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
}

/// Body of `PATCH /repos/{owner}/{repo}/check-runs/{id}`.
/// Build it with [`UpdateCheckRun::to_state`] so that status and conclusion never disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateCheckRun {
    status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    conclusion: Option<Conclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<CheckRunOutput>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<CheckRunAction>,
}

impl UpdateCheckRun {
    pub fn to_state(state: CheckRunState) -> Self {
        let now = Utc::now();
        Self {
            status: state.status(),
            conclusion: state.conclusion(),
            started_at: (state == CheckRunState::InProgress).then_some(now),
            completed_at: state.is_completed().then_some(now),
            output: None,
            actions: Vec::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn conclusion(&self) -> Option<Conclusion> {
        self.conclusion
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub text: String,
}

/// Button shown on a check run. GitHub sends `check_run.requested_action` when it is clicked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRunAction {
    pub label: String,
    pub description: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteCheckRun {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub head_sha: String,
    pub status: JobStatus,
    #[serde(default)]
    pub conclusion: Option<Conclusion>,
}

impl RemoteCheckRun {
    pub fn state(&self) -> CheckRunState {
        CheckRunState::from_remote(self.status, self.conclusion)
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    check_runs: Vec<RemoteCheckRun>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommitState {
    Error,
    Failure,
    Pending,
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateCommitStatus {
    pub state: CommitState,
    pub description: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateIssueComment<'body> {
    body: &'body str,
}

// ClientWithMiddleware can be cloned, it's like Arc::clone.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: ClientWithMiddleware,
    base_url: Url,
}

impl RestClient {
    pub fn new(config: &GithubApiConfig) -> Result<Self> {
        Ok(Self {
            http: config.http_client()?,
            base_url: config.base_url(),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("invalid GitHub API path: {path}"))
    }

    // `bearer` can be an app token or an installation token.
    async fn send<S: Serialize + Sync>(
        &self,
        bearer: &str,
        method: Method,
        url: Url,
        body: Option<&S>,
    ) -> Result<Response> {
        debug!("sending HTTP {method} request to {url}");
        let mut req = self
            .http
            .request(method, url)
            .header("accept", "application/vnd.github+json")
            .bearer_auth(bearer)
            .header("x-github-api-version", GITHUB_API_VERSION)
            .header("user-agent", OUR_USER_AGENT);
        if let Some(b) = body {
            req = req.json(b);
        }

        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }
        let body = res.text().await.unwrap_or_default();
        let err = map_github_error(status, body);
        warn!(%status, "GitHub API request failed: {err}");
        Err(err.into())
    }

    async fn send_json<T: DeserializeOwned, S: Serialize + Sync>(
        &self,
        bearer: &str,
        method: Method,
        url: Url,
        body: Option<&S>,
    ) -> Result<T> {
        let res = self.send(bearer, method, url, body).await?;
        res.json::<T>()
            .await
            .with_context(|| "failed to parse GitHub API response")
    }
}

#[async_trait]
impl GithubClient for RestClient {
    async fn get_app_metadata(&self, app_token: &AppToken) -> Result<AppMetadata> {
        let url = self.url("app")?;
        self.send_json::<_, ()>(app_token.bearer(), Method::GET, url, None)
            .await
            .with_context(|| "failed to fetch app metadata")
    }

    async fn exchange_installation_token(
        &self,
        app_token: &AppToken,
        installation_id: i64,
    ) -> Result<InstallationTokenGrant> {
        info!(installation_id, "fetching installation access token");
        let url = self.url(&format!("app/installations/{installation_id}/access_tokens"))?;
        self.send_json::<_, ()>(app_token.bearer(), Method::POST, url, None)
            .await
            .with_context(|| {
                format!("failed to fetch installation access token: installation_id={installation_id}")
            })
    }

    async fn create_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        input: &CreateCheckRun,
    ) -> Result<RemoteCheckRun> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        info!(owner, repo = name, head_sha = %input.head_sha, "creating check run");
        if let Some(output) = &input.output {
            validate_output(output)?;
        }
        let url = self.url(&format!("repos/{owner}/{name}/check-runs"))?;
        self.send_json(token.bearer(), Method::POST, url, Some(input))
            .await
            .with_context(|| {
                format!(
                    "failed to create check_run: owner={owner}, repo={name}, head_sha={}",
                    input.head_sha
                )
            })
    }

    async fn update_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
        input: &UpdateCheckRun,
    ) -> Result<RemoteCheckRun> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        info!(
            owner,
            repo = name,
            check_run_id,
            status = %input.status(),
            conclusion = input.conclusion().map(|c| c.to_string()),
            "updating check run"
        );
        if let Some(output) = &input.output {
            validate_output(output)?;
        }
        let url = self.url(&format!("repos/{owner}/{name}/check-runs/{check_run_id}"))?;
        self.send_json(token.bearer(), Method::PATCH, url, Some(input))
            .await
            .with_context(|| {
                format!("failed to update check_run: owner={owner}, repo={name}, id={check_run_id}")
            })
    }

    async fn get_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
    ) -> Result<RemoteCheckRun> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        let url = self.url(&format!("repos/{owner}/{name}/check-runs/{check_run_id}"))?;
        self.send_json::<_, ()>(token.bearer(), Method::GET, url, None)
            .await
            .with_context(|| {
                format!("failed to get check_run: owner={owner}, repo={name}, id={check_run_id}")
            })
    }

    async fn list_check_runs_for_ref(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        git_ref: &str,
        check_name: &str,
    ) -> Result<Vec<RemoteCheckRun>> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        let mut url = self.url(&format!("repos/{owner}/{name}/commits/{git_ref}/check-runs"))?;
        url.query_pairs_mut()
            .append_pair("check_name", check_name)
            .append_pair("filter", "latest")
            .append_pair("per_page", "100");
        let list: CheckRunList = self
            .send_json::<_, ()>(token.bearer(), Method::GET, url, None)
            .await
            .with_context(|| {
                format!("failed to list check_runs: owner={owner}, repo={name}, ref={git_ref}")
            })?;
        Ok(list.check_runs)
    }

    async fn rerequest_check_run(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
    ) -> Result<()> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        info!(owner, repo = name, check_run_id, "rerequesting check run");
        let url = self.url(&format!(
            "repos/{owner}/{name}/check-runs/{check_run_id}/rerequest"
        ))?;
        self.send::<()>(token.bearer(), Method::POST, url, None)
            .await
            .with_context(|| {
                format!(
                    "failed to rerequest check_run: owner={owner}, repo={name}, id={check_run_id}"
                )
            })?;
        Ok(())
    }

    async fn create_commit_status(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        sha: &str,
        input: &CreateCommitStatus,
    ) -> Result<()> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        info!(owner, repo = name, sha, state = %input.state, "creating commit status");
        let url = self.url(&format!("repos/{owner}/{name}/statuses/{sha}"))?;
        self.send(token.bearer(), Method::POST, url, Some(input))
            .await
            .with_context(|| {
                format!("failed to create commit status: owner={owner}, repo={name}, sha={sha}")
            })?;
        Ok(())
    }

    async fn create_issue_comment(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let (owner, name) = (repo.owner(), repo.name.as_str());
        info!(owner, repo = name, issue_number, "creating issue comment");
        validate_text_length(body)?;
        let url = self.url(&format!(
            "repos/{owner}/{name}/issues/{issue_number}/comments"
        ))?;
        self.send(
            token.bearer(),
            Method::POST,
            url,
            Some(&CreateIssueComment { body }),
        )
        .await
        .with_context(|| {
            format!(
                "failed to create issue comment: owner={owner}, repo={name}, number={issue_number}"
            )
        })?;
        Ok(())
    }
}

fn validate_output(output: &CheckRunOutput) -> Result<()> {
    validate_text_length(&output.summary)?;
    validate_text_length(&output.text)
}

fn validate_text_length(text: &str) -> Result<()> {
    if text.len() > MAX_TEXT_LENGTH {
        bail!("text length must be less than 65536 characters");
    }
    Ok(())
}

#[cfg(test)]
pub fn remote_check_run(id: i64, state: CheckRunState) -> RemoteCheckRun {
    RemoteCheckRun {
        id,
        name: "status-checker".to_owned(),
        head_sha: "abc123".to_owned(),
        status: state.status(),
        conclusion: state.conclusion(),
    }
}
