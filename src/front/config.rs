use std::time::Duration;

use clap::Args;
use indoc::indoc;

const DEFAULT_PULL_REQUEST_COMMENT: &str = indoc! {"
    Thanks for the pull request! Checks run for every pushed commit.
    Add the `ci:skip` label to skip them, or `ci:rerun` to run them again."
};

#[derive(Debug, Args, Clone)]
pub struct FrontConfig {
    /// GitHub webhook secret to verify incoming webhook requests.
    #[arg(env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true, long)]
    pub webhook_secret: String,
    /// Timeout for server to process each request. Jobs run after the response and are not bound by it.
    #[arg(env, long, default_value = "30s")]
    pub server_timeout: humantime::Duration,
    /// Name of the check run created for each commit.
    #[arg(env, long, default_value = "status-checker")]
    pub check_run_name: String,
    /// Pull request label which completes the check run as skipped.
    #[arg(env, long, default_value = "ci:skip")]
    pub skip_label: String,
    /// Pull request label which rerequests the check run.
    #[arg(env, long, default_value = "ci:rerun")]
    pub rerun_label: String,
    /// Comment posted on opened and reopened pull requests. Empty disables it.
    #[arg(env, long, default_value = DEFAULT_PULL_REQUEST_COMMENT)]
    pub pull_request_comment: String,
    /// Number of recent delivery IDs remembered to drop redeliveries. 0 disables it.
    #[arg(env, long, default_value = "0")]
    pub delivery_dedup_capacity: u64,
    /// How long a delivery ID is remembered.
    #[arg(env, long, default_value = "1h")]
    pub delivery_dedup_ttl: humantime::Duration,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            webhook_secret: Default::default(),
            server_timeout: Duration::from_secs(30).into(),
            check_run_name: "status-checker".to_owned(),
            skip_label: "ci:skip".to_owned(),
            rerun_label: "ci:rerun".to_owned(),
            pull_request_comment: DEFAULT_PULL_REQUEST_COMMENT.to_owned(),
            delivery_dedup_capacity: 0,
            delivery_dedup_ttl: Duration::from_secs(60 * 60).into(),
        }
    }
}
