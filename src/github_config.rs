use anyhow::{Context as _, Result};
use clap::{Args, ValueEnum};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{Jitter, RetryTransientMiddleware, policies::ExponentialBackoff};
use url::Url;

#[derive(Debug, Args, Clone)]
pub struct GithubAppConfig {
    /// GitHub App ID.
    #[arg(env = "GITHUB_APP_ID", long)]
    pub app_id: i64,
    /// GitHub App private key in PEM format. Literal `\n` sequences are accepted as newlines.
    #[arg(env = "GITHUB_PRIVATE_KEY", hide_env_values = true, long)]
    pub private_key: String,
    /// Lifetime of minted app tokens. GitHub accepts 10 minutes at most, longer values are clamped.
    #[arg(env, long, default_value = "10m")]
    pub app_token_lifetime: humantime::Duration,
}

/// How the app talks to the GitHub REST API. Transient failures (connection errors, 5xx, 429)
/// are retried with exponential backoff.
#[derive(Debug, Args, Clone)]
pub struct GithubApiConfig {
    /// Base URL of GitHub REST API. Use `https://<host>/api/v3` for GitHub Enterprise Server.
    #[arg(env, long, default_value = "https://api.github.com")]
    pub github_api_url: Url,
    /// Connect timeout per attempt.
    #[arg(env, long, default_value = "1s")]
    pub github_connect_timeout: humantime::Duration,
    /// Read timeout per attempt, measured from connect.
    #[arg(env, long, default_value = "10s")]
    pub github_read_timeout: humantime::Duration,
    /// Retries after the first attempt. 0 disables retrying.
    #[arg(env, long, default_value = "3")]
    pub github_max_retry: u32,
    /// Backoff before the first retry.
    #[arg(env, long, default_value = "1s")]
    pub github_min_retry_interval: humantime::Duration,
    /// Upper bound of the backoff. Keep it well below the server timeout.
    #[arg(env, long, default_value = "1m")]
    pub github_max_retry_interval: humantime::Duration,
    #[arg(env, long, default_value = "full")]
    pub github_retry_jitter: JitterConfig,
    /// Backoff grows by this factor on every retry.
    #[arg(env, long, default_value = "2")]
    pub github_retry_base: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitterConfig {
    None,
    /// Anywhere between zero and the backoff.
    Full,
    /// Anywhere between the minimum retry interval and the backoff.
    Bounded,
}

impl From<JitterConfig> for Jitter {
    fn from(jitter: JitterConfig) -> Self {
        match jitter {
            JitterConfig::None => Self::None,
            JitterConfig::Full => Self::Full,
            JitterConfig::Bounded => Self::Bounded,
        }
    }
}

impl GithubApiConfig {
    /// Base URL with a trailing slash, so relative paths keep an `/api/v3` prefix when joined.
    pub fn base_url(&self) -> Url {
        let mut url = self.github_api_url.clone();
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .jitter(self.github_retry_jitter.into())
            .base(self.github_retry_base)
            .retry_bounds(
                self.github_min_retry_interval.into(),
                self.github_max_retry_interval.into(),
            )
            .build_with_max_retries(self.github_max_retry)
    }

    pub fn http_client(&self) -> Result<ClientWithMiddleware> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.github_connect_timeout.into())
            .read_timeout(self.github_read_timeout.into())
            .build()
            .with_context(|| "failed to build HTTP client")?;
        Ok(ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(self.retry_policy()))
            .build())
    }
}

#[cfg(test)]
pub mod test {
    use std::time::Duration;

    use super::*;

    pub const TEST_APP_ID: i64 = 4242;
    pub const TEST_PRIVATE_KEY: &str = include_str!("testdata/app-private-key.pem");
    pub const TEST_PUBLIC_KEY: &str = include_str!("testdata/app-public-key.pem");

    impl Default for GithubAppConfig {
        fn default() -> Self {
            Self {
                app_id: TEST_APP_ID,
                private_key: TEST_PRIVATE_KEY.to_owned(),
                app_token_lifetime: Duration::from_secs(600).into(),
            }
        }
    }

    impl Default for GithubApiConfig {
        fn default() -> Self {
            Self {
                github_api_url: Url::parse("https://api.github.com").unwrap(),
                github_connect_timeout: Duration::from_secs(1).into(),
                github_read_timeout: Duration::from_secs(1).into(),
                github_max_retry: 0,
                github_min_retry_interval: Duration::from_secs(1).into(),
                github_max_retry_interval: Duration::from_secs(1).into(),
                github_retry_jitter: JitterConfig::None,
                github_retry_base: 2,
            }
        }
    }

    #[test]
    fn base_url_keeps_enterprise_prefix() {
        let config = GithubApiConfig {
            github_api_url: Url::parse("https://ghe.example.com/api/v3").unwrap(),
            ..Default::default()
        };
        let url = config.base_url().join("app/installations/1/access_tokens").unwrap();
        assert_eq!(
            url.as_str(),
            "https://ghe.example.com/api/v3/app/installations/1/access_tokens"
        );
    }

    #[test]
    fn base_url_public() {
        let url = GithubApiConfig::default().base_url().join("app").unwrap();
        assert_eq!(url.as_str(), "https://api.github.com/app");
    }
}
