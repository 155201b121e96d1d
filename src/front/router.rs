use std::sync::Arc;

use anyhow::{Error, Result};
use tracing::{info, instrument};

use crate::{
    check_run::{
        CheckRunController, CheckRunIndex, CheckRunView, CiJob, CompletePolicy, Conclusion, Job,
        JobRunner, TransitionError,
    },
    front::{
        FrontConfig,
        actions::{ActionRegistry, ActionRequest},
        github_events::{CheckRunEvent, CheckSuiteEvent, GithubEvent, PullRequestEvent},
    },
    github_client::GithubClient,
    github_token::TokenFetcher,
};

/// Result of a dispatch which did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// Nothing to do. The reason is returned to GitHub as the response body.
    Ignored(String),
}

/// Routes verified webhook events to the check run lifecycle.
pub struct EventRouter<GH: GithubClient, F: TokenFetcher, J: CiJob> {
    app_id: i64,
    client: Arc<GH>,
    controller: Arc<CheckRunController<GH>>,
    tokens: F,
    jobs: JobRunner<GH, J>,
    actions: ActionRegistry,
    skip_label: String,
    rerun_label: String,
    pull_request_comment: String,
}

impl<GH, F, J> EventRouter<GH, F, J>
where
    GH: GithubClient + 'static,
    F: TokenFetcher,
    J: CiJob + 'static,
{
    pub fn new(
        app_id: i64,
        config: &FrontConfig,
        client: Arc<GH>,
        tokens: F,
        job: J,
        job_timeout: humantime::Duration,
        actions: ActionRegistry,
    ) -> Self {
        let controller = Arc::new(CheckRunController::new(
            Arc::clone(&client),
            CheckRunIndex::default(),
            config.check_run_name.clone(),
        ));
        Self {
            app_id,
            client,
            jobs: JobRunner::new(Arc::clone(&controller), job, job_timeout),
            controller,
            tokens,
            actions,
            skip_label: config.skip_label.clone(),
            rerun_label: config.rerun_label.clone(),
            pull_request_comment: config.pull_request_comment.clone(),
        }
    }

    /// Jobs started by `check_run.created` deliveries. They outlive the delivery.
    pub const fn jobs(&self) -> &JobRunner<GH, J> {
        &self.jobs
    }

    #[instrument(skip_all, fields(installation_id = event.installation_id()))]
    pub async fn dispatch(&self, event: GithubEvent, delivery_id: &str) -> Result<Outcome> {
        match event {
            GithubEvent::CheckSuiteRequested(e) => self.on_check_suite(&e, delivery_id).await,
            GithubEvent::CheckRunCreated(e) => self.on_check_run_created(&e, delivery_id).await,
            GithubEvent::CheckRunRerequested(e) => {
                self.on_check_run_rerequested(&e, delivery_id).await
            }
            GithubEvent::CheckRunRequestedAction(e) => {
                self.on_requested_action(&e, delivery_id).await
            }
            GithubEvent::PullRequestOpened(e) => self.on_pull_request_opened(&e).await,
            GithubEvent::PullRequestLabeled(e) => self.on_labeled(&e, delivery_id).await,
        }
    }

    async fn on_check_suite(&self, e: &CheckSuiteEvent, delivery_id: &str) -> Result<Outcome> {
        let token = self.tokens.installation_token(e.installation.id).await?;
        self.controller
            .create(
                &token,
                &e.repository,
                &e.check_suite.head_sha,
                CheckRunView::queued(delivery_id),
            )
            .await?;
        Ok(Outcome::Handled)
    }

    async fn on_check_run_rerequested(
        &self,
        e: &CheckRunEvent,
        delivery_id: &str,
    ) -> Result<Outcome> {
        if let Some(outcome) = self.ignore_other_app(e) {
            return Ok(outcome);
        }
        let token = self.tokens.installation_token(e.installation.id).await?;
        self.controller
            .create(
                &token,
                &e.repository,
                &e.check_run.head_sha,
                CheckRunView::queued(delivery_id),
            )
            .await?;
        Ok(Outcome::Handled)
    }

    async fn on_check_run_created(&self, e: &CheckRunEvent, delivery_id: &str) -> Result<Outcome> {
        if let Some(outcome) = self.ignore_other_app(e) {
            return Ok(outcome);
        }
        let token = self.tokens.installation_token(e.installation.id).await?;
        let (repo, head_sha) = (&e.repository, e.check_run.head_sha.as_str());

        let run = match self
            .controller
            .start(
                &token,
                repo,
                head_sha,
                e.check_run.id,
                CheckRunView::in_progress(delivery_id),
            )
            .await
        {
            Ok(run) => run,
            Err(err) => return ignore_transition_error(err),
        };

        let job = Job {
            repository: repo.clone(),
            head_sha: head_sha.to_owned(),
            check_run_id: run.id,
            delivery_id: delivery_id.to_owned(),
            token,
        };
        // The delivery is answered now, the job completes the run on its own.
        self.jobs.spawn(job, run);
        Ok(Outcome::Handled)
    }

    async fn on_requested_action(&self, e: &CheckRunEvent, delivery_id: &str) -> Result<Outcome> {
        if let Some(outcome) = self.ignore_other_app(e) {
            return Ok(outcome);
        }
        let identifier = e
            .requested_action
            .as_ref()
            .map_or("", |a| a.identifier.as_str());
        let Some(action) = self.actions.get(identifier) else {
            info!(identifier, "unknown requested action");
            return Ok(Outcome::Ignored(format!(
                "Unknown requested action, skipping: {identifier}"
            )));
        };

        let req = ActionRequest {
            repository: e.repository.clone(),
            head_sha: e.check_run.head_sha.clone(),
            check_run_id: e.check_run.id,
            delivery_id: delivery_id.to_owned(),
            token: self.tokens.installation_token(e.installation.id).await?,
        };
        info!(identifier, "handling requested action");
        action.handle(&req).await?;
        Ok(Outcome::Handled)
    }

    async fn on_pull_request_opened(&self, e: &PullRequestEvent) -> Result<Outcome> {
        if self.pull_request_comment.is_empty() {
            return Ok(Outcome::Ignored(
                "Pull request comment is disabled".to_owned(),
            ));
        }
        let token = self.tokens.installation_token(e.installation.id).await?;
        self.client
            .create_issue_comment(&token, &e.repository, e.number, &self.pull_request_comment)
            .await?;
        Ok(Outcome::Handled)
    }

    async fn on_labeled(&self, e: &PullRequestEvent, delivery_id: &str) -> Result<Outcome> {
        let label = e.label.as_ref().map_or("", |l| l.name.as_str());
        let skip = label == self.skip_label;
        if !skip && label != self.rerun_label {
            return Ok(Outcome::Ignored(format!("Unhandled label, skipping: {label}")));
        }

        let token = self.tokens.installation_token(e.installation.id).await?;
        let head_sha = e.pull_request.head.sha.as_str();
        let Some(run) = self
            .controller
            .active(&token, &e.repository, head_sha)
            .await?
        else {
            return Ok(Outcome::Ignored(format!(
                "No check run found for the commit, skipping: {head_sha}"
            )));
        };

        if skip {
            info!(label, check_run_id = run.id, "skipping check run by label");
            let result = self
                .controller
                .complete(
                    &token,
                    &e.repository,
                    head_sha,
                    run,
                    Conclusion::Skipped,
                    CompletePolicy::AllowFromQueued,
                    CheckRunView::skipped(label, delivery_id),
                )
                .await;
            match result {
                Ok(_) => Ok(Outcome::Handled),
                Err(err) => ignore_transition_error(err),
            }
        } else {
            info!(label, check_run_id = run.id, "rerunning check run by label");
            self.controller
                .rerequest(&token, &e.repository, run.id)
                .await?;
            Ok(Outcome::Handled)
        }
    }

    // Check runs of other apps on the same commit are delivered too.
    fn ignore_other_app(&self, e: &CheckRunEvent) -> Option<Outcome> {
        (e.check_run.app.id != self.app_id).then(|| {
            info!(app_id = e.check_run.app.id, "check run of another app");
            Outcome::Ignored(format!(
                "Check run of another app, skipping: {}",
                e.check_run.app.id
            ))
        })
    }
}

// Redeliveries and races between deliveries show up as illegal transitions. They are not failures.
fn ignore_transition_error(err: Error) -> Result<Outcome> {
    match err.downcast_ref::<TransitionError>() {
        Some(e) => {
            info!("ignoring check run transition: {e}");
            Ok(Outcome::Ignored(format!("Check run left as is: {e}")))
        }
        None => Err(err),
    }
}
