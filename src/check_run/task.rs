use std::{env, process::Output};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use clap::{ArgAction, Args};
use tokio::{process::Command, time::Instant};
use tracing::{info, trace};

use crate::{check_run::Conclusion, events::GithubRepository, github_token::InstallationToken};

// Leave room for the headings around stdout and stderr.
const MAX_STREAM_LENGTH: usize = 30_000;

#[derive(Debug, Clone, Args)]
pub struct JobConfig {
    /// Command to run for each check run, given after `--`. Executed without any shell, every
    /// argument is passed as is. Without a command, check runs conclude as neutral right after starting.
    #[arg(last = true, value_name = "JOB_COMMAND")]
    pub job_command: Vec<String>,
    /// Timeout for the command execution. On expiry the check run concludes as timed_out.
    #[arg(long, env, default_value = "10m")]
    pub job_timeout: humantime::Duration,
    /// Wrap stdout and stderr with code block in the check run output.
    #[arg(long, env, default_value = "true", action = ArgAction::Set)]
    pub wrap_stdout: bool,
}

/// Everything a job may need to know about the check run it reports to.
#[derive(Debug, Clone)]
pub struct Job {
    pub repository: GithubRepository,
    pub head_sha: String,
    pub check_run_id: i64,
    pub delivery_id: String,
    pub token: InstallationToken,
}

/// Outcome of a job, reported as the check run conclusion and output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub conclusion: Conclusion,
    pub title: String,
    pub summary: String,
    pub text: String,
}

/// The CI work done between `in_progress` and `completed`.
/// Errors mean the job could not be run at all, a failing job is an `Ok` report with a failure conclusion.
#[allow(clippy::indexing_slicing)] // For automock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CiJob: Send + Sync {
    async fn run(&self, job: &Job) -> Result<JobReport>;
}

#[derive(Debug, Clone)]
pub struct CommandJob {
    command: Vec<String>,
    wrap_stdout: bool,
}

impl CommandJob {
    pub fn new(config: &JobConfig) -> Self {
        Self {
            command: config.job_command.clone(),
            wrap_stdout: config.wrap_stdout,
        }
    }

    fn build_command(&self, program: &str, args: &[String], job: &Job) -> Command {
        let mut c = Command::new(program);
        // Without strong guarantee of killing the child process.
        // https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.kill_on_drop
        c.args(args)
            .kill_on_drop(true)
            .env_clear()
            .env("GITHUB_TOKEN", job.token.bearer())
            .env("CI_COMMIT", &job.head_sha)
            .env("CI_REPO_OWNER", job.repository.owner())
            .env("CI_REPO_NAME", &job.repository.name)
            .env("CI_REPO_FULL_NAME", &job.repository.full_name)
            .env("CI_CHECK_RUN_ID", job.check_run_id.to_string())
            .env("CI_INSTALLATION_ID", job.token.installation_id().to_string())
            .env("CI_DELIVERY_ID", &job.delivery_id);
        if let Ok(v) = env::var("PATH") {
            c.env("PATH", v);
        }
        c
    }

    fn to_text(&self, out: &Output) -> String {
        let stdout = String::from_utf8_lossy(&out.stdout);
        let stderr = String::from_utf8_lossy(&out.stderr);
        let (stdout, stderr) = (
            tail(&stdout, MAX_STREAM_LENGTH),
            tail(&stderr, MAX_STREAM_LENGTH),
        );

        if self.wrap_stdout {
            format!("## stdout\n```\n{stdout}\n```\n## stderr\n```\n{stderr}\n```")
        } else {
            format!("## stdout\n{stdout}\n## stderr\n{stderr}")
        }
    }
}

#[async_trait]
impl CiJob for CommandJob {
    async fn run(&self, job: &Job) -> Result<JobReport> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(JobReport {
                conclusion: Conclusion::Neutral,
                title: "No job configured".to_owned(),
                summary: "Nothing to run for this commit.".to_owned(),
                text: String::new(),
            });
        };
        let cmdline = self.command.join(" ");
        info!(command = cmdline, "running command");
        let start = Instant::now();

        let out = self
            .build_command(program, args, job)
            .output()
            .await
            .with_context(|| format!("failed to run command: {cmdline}"))?;

        // For pretty logging newlines, don't use structured logging here.
        trace!("stdout:\n{}", String::from_utf8_lossy(&out.stdout));
        trace!("stderr:\n{}", String::from_utf8_lossy(&out.stderr));

        let report = if out.status.success() {
            info!(elapsed = ?start.elapsed(), "command succeeded");
            JobReport {
                conclusion: Conclusion::Success,
                title: "Job succeeded".to_owned(),
                summary: format!("Command succeeded: `{cmdline}`"),
                text: self.to_text(&out),
            }
        } else {
            info!(status = %out.status, elapsed = ?start.elapsed(), "command failed");
            JobReport {
                conclusion: Conclusion::Failure,
                title: "Job failed".to_owned(),
                summary: format!("Command failed with {}: `{cmdline}`", out.status),
                text: self.to_text(&out),
            }
        };
        Ok(report)
    }
}

// Keep the end of the output, it is where errors usually are.
fn tail(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s.get(start..).unwrap_or_default()
}
