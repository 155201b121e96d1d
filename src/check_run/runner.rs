use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tokio::{
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{Instrument as _, error, info, warn};

use crate::{
    check_run::{
        CheckRunController, CheckRunView, CiJob, CompletePolicy, Conclusion, Job, TrackedCheckRun,
        TransitionError,
    },
    github_client::GithubClient,
};

/// Runs CI jobs for started check runs and completes them, detached from the webhook request.
///
/// GitHub gives up on a delivery after a few seconds. The job and the completion of its check run
/// must survive that, so they run on their own task. Tasks are tracked for [`JobRunner::wait`].
pub struct JobRunner<GH: GithubClient, J: CiJob> {
    controller: Arc<CheckRunController<GH>>,
    job: Arc<J>,
    job_timeout: humantime::Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl<GH, J> JobRunner<GH, J>
where
    GH: GithubClient + 'static,
    J: CiJob + 'static,
{
    pub fn new(
        controller: Arc<CheckRunController<GH>>,
        job: J,
        job_timeout: humantime::Duration,
    ) -> Self {
        Self {
            controller,
            job: Arc::new(job),
            job_timeout,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Run `job` for `run`, which must be in progress, and complete the run with its outcome.
    /// Returns immediately. Logs of the task stay in the current span.
    pub fn spawn(&self, job: Job, run: TrackedCheckRun) {
        let controller = Arc::clone(&self.controller);
        let ci = Arc::clone(&self.job);
        let job_timeout = self.job_timeout;
        let task = run_to_completion(controller, ci, job_timeout, job, run);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(finished) = tasks.try_join_next() {
            log_join_error(finished);
        }
        tasks.spawn(task.in_current_span());
        info!(check_run_id = run.id, running = tasks.len(), "job spawned");
    }

    /// Number of jobs not reaped yet.
    pub fn running(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Wait for every spawned job, at most `grace`. Jobs still running afterwards are aborted
    /// and their check runs stay in progress.
    pub async fn wait(&self, grace: Duration) {
        let mut tasks = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            mem::take(&mut *tasks)
        };
        if tasks.is_empty() {
            return;
        }
        info!(running = tasks.len(), "waiting for running jobs");
        let drained = timeout(grace, async {
            while let Some(finished) = tasks.join_next().await {
                log_join_error(finished);
            }
        })
        .await;
        if drained.is_err() {
            warn!(aborted = tasks.len(), "jobs still running, aborting them");
            tasks.shutdown().await;
        }
    }
}

async fn run_to_completion<GH: GithubClient, J: CiJob>(
    controller: Arc<CheckRunController<GH>>,
    ci: Arc<J>,
    job_timeout: humantime::Duration,
    job: Job,
    run: TrackedCheckRun,
) {
    let delivery_id = job.delivery_id.as_str();
    let (conclusion, view) = match timeout(job_timeout.into(), ci.run(&job)).await {
        Ok(Ok(report)) => (
            report.conclusion,
            CheckRunView::from_report(&report, delivery_id),
        ),
        Ok(Err(err)) => {
            error!("job failed to run: {err:#}");
            (
                Conclusion::Failure,
                CheckRunView::job_failed(&err, delivery_id),
            )
        }
        Err(_) => {
            info!(timeout = %job_timeout, "job timed out");
            (
                Conclusion::TimedOut,
                CheckRunView::timed_out(job_timeout, delivery_id),
            )
        }
    };

    let result = controller
        .complete(
            &job.token,
            &job.repository,
            &job.head_sha,
            run,
            conclusion,
            CompletePolicy::RequireStarted,
            view,
        )
        .await;
    match result {
        Ok(run) => info!(check_run_id = run.id, %conclusion, "job finished"),
        Err(err) => match err.downcast_ref::<TransitionError>() {
            // Skipped by a label while the job was running.
            Some(e) => info!("check run left as is: {e}"),
            None => error!(check_run_id = run.id, "failed to complete check run: {err:#}"),
        },
    }
}

fn log_join_error(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        error!("job task did not finish: {e}");
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    use super::*;
    use crate::{
        check_run::{CheckRunIndex, CheckRunState, JobReport, MockCiJob},
        events::GithubRepository,
        github_client::{MockGithubClient, remote_check_run},
        github_token::InstallationToken,
    };

    const SHA: &str = "abc123";

    fn job() -> Job {
        Job {
            repository: GithubRepository {
                full_name: "octocat/hello".to_owned(),
                name: "hello".to_owned(),
                ..Default::default()
            },
            head_sha: SHA.to_owned(),
            check_run_id: 10,
            delivery_id: "d".to_owned(),
            token: InstallationToken::for_test(1),
        }
    }

    fn started() -> TrackedCheckRun {
        TrackedCheckRun {
            id: 10,
            state: CheckRunState::InProgress,
        }
    }

    fn report(conclusion: Conclusion) -> JobReport {
        JobReport {
            conclusion,
            title: "title".to_owned(),
            summary: "summary".to_owned(),
            text: String::new(),
        }
    }

    fn expect_completed(client: &mut MockGithubClient, conclusion: Conclusion) {
        let state = CheckRunState::Completed(conclusion);
        client
            .expect_update_check_run()
            .withf(move |_, _, id, input| {
                *id == 10
                    && input.status() == state.status()
                    && input.conclusion() == state.conclusion()
            })
            .once()
            .returning(move |_, _, id, _| Ok(remote_check_run(id, state)));
    }

    fn runner<J: CiJob + 'static>(
        client: MockGithubClient,
        job: J,
        job_timeout: Duration,
    ) -> JobRunner<MockGithubClient, J> {
        let controller = CheckRunController::new(
            Arc::new(client),
            CheckRunIndex::default(),
            "status-checker".to_owned(),
        );
        JobRunner::new(Arc::new(controller), job, job_timeout.into())
    }

    #[tokio::test]
    async fn report_becomes_conclusion() {
        let mut client = MockGithubClient::new();
        expect_completed(&mut client, Conclusion::Failure);
        let mut ci = MockCiJob::new();
        ci.expect_run()
            .withf(|job| job.check_run_id == 10)
            .once()
            .returning(|_| Ok(report(Conclusion::Failure)));
        let r = runner(client, ci, Duration::from_secs(60));

        r.spawn(job(), started());
        r.wait(Duration::from_secs(5)).await;
        assert_eq!(r.running(), 0);
    }

    #[tokio::test]
    async fn job_error_completes_as_failure() {
        let mut client = MockGithubClient::new();
        expect_completed(&mut client, Conclusion::Failure);
        let mut ci = MockCiJob::new();
        ci.expect_run()
            .returning(|_| Err(anyhow!("no such program")));
        let r = runner(client, ci, Duration::from_secs(60));

        r.spawn(job(), started());
        r.wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn slow_job_times_out() {
        let mut client = MockGithubClient::new();
        expect_completed(&mut client, Conclusion::TimedOut);
        let r = runner(client, SlowJob, Duration::from_millis(10));

        r.spawn(job(), started());
        r.wait(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn job_outlives_its_caller() {
        let mut client = MockGithubClient::new();
        expect_completed(&mut client, Conclusion::Success);
        let r = Arc::new(runner(client, ShortJob, Duration::from_secs(60)));

        // The webhook request is gone long before the job finishes.
        let caller = {
            let r = Arc::clone(&r);
            tokio::spawn(async move {
                r.spawn(job(), started());
                sleep(Duration::from_secs(60)).await;
            })
        };
        sleep(Duration::from_millis(10)).await;
        caller.abort();
        assert_eq!(r.running(), 1);

        r.wait(Duration::from_secs(5)).await;
        assert_eq!(r.running(), 0);
    }

    #[tokio::test]
    async fn unfinished_jobs_are_aborted_after_grace() {
        let mut client = MockGithubClient::new();
        client.expect_update_check_run().never();
        let r = runner(client, SlowJob, Duration::from_secs(600));

        r.spawn(job(), started());
        r.wait(Duration::from_millis(10)).await;
        assert_eq!(r.running(), 0);
    }

    struct SlowJob;

    #[async_trait]
    impl CiJob for SlowJob {
        async fn run(&self, _job: &Job) -> Result<JobReport> {
            sleep(Duration::from_secs(60)).await;
            Ok(report(Conclusion::Success))
        }
    }

    struct ShortJob;

    #[async_trait]
    impl CiJob for ShortJob {
        async fn run(&self, _job: &Job) -> Result<JobReport> {
            sleep(Duration::from_millis(50)).await;
            Ok(report(Conclusion::Success))
        }
    }
}
