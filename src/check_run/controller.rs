use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::{
    check_run::{
        CheckRunIndex, CheckRunKey, CheckRunState, CheckRunView, CompletePolicy, Conclusion,
        JobStatus, TrackedCheckRun,
    },
    events::GithubRepository,
    github_client::{CreateCheckRun, GithubClient, UpdateCheckRun},
    github_token::InstallationToken,
};

/// Moves check runs through their lifecycle on GitHub and keeps the index in step.
///
/// Every call touching one (repository, head SHA) pair runs under the index lock for that pair,
/// so transitions for the same commit never interleave. The CI job itself runs outside the lock.
pub struct CheckRunController<GH: GithubClient> {
    client: Arc<GH>,
    index: CheckRunIndex,
    check_run_name: String,
}

impl<GH: GithubClient> CheckRunController<GH> {
    pub fn new(client: Arc<GH>, index: CheckRunIndex, check_run_name: String) -> Self {
        Self {
            client,
            index,
            check_run_name,
        }
    }

    /// Create a new queued check run and track it for the commit, replacing any earlier one.
    #[instrument(skip(self, token, view), fields(repo = %repo))]
    pub async fn create(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        head_sha: &str,
        view: CheckRunView,
    ) -> Result<TrackedCheckRun> {
        let key = CheckRunKey::new(repo, head_sha);
        let _guard = self.index.lock(&key).await;

        let input = CreateCheckRun {
            name: self.check_run_name.clone(),
            head_sha: head_sha.to_owned(),
            status: JobStatus::Queued,
            output: view.output,
        };
        let remote = self.client.create_check_run(token, repo, &input).await?;
        let run = TrackedCheckRun {
            id: remote.id,
            state: CheckRunState::Queued,
        };
        self.index.insert(key, run);
        info!(check_run_id = run.id, "check run queued");
        Ok(run)
    }

    /// `queued -> in_progress`. The state of a run missing from the index (restart, expired
    /// entry, replaced by a newer run) is fetched from GitHub, so a finished run is never reopened.
    #[instrument(skip(self, token, view), fields(repo = %repo))]
    pub async fn start(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        head_sha: &str,
        check_run_id: i64,
        view: CheckRunView,
    ) -> Result<TrackedCheckRun> {
        let key = CheckRunKey::new(repo, head_sha);
        let _guard = self.index.lock(&key).await;

        let current = match self.tracked_state(&key, check_run_id) {
            Some(state) => state,
            None => {
                let remote = self.client.get_check_run(token, repo, check_run_id).await?;
                debug!(check_run_id, state = %remote.state(), "check run state fetched from GitHub");
                remote.state()
            }
        };
        let next = current.start()?;
        self.transition(token, repo, key, check_run_id, next, view)
            .await
    }

    /// Complete `run` with `conclusion`. `policy` decides whether a run may skip `in_progress`.
    ///
    /// The index is more recent than `run.state` when both know the run, e.g. when the run was
    /// completed by a label while its job was still going.
    #[instrument(skip(self, token, run, view), fields(repo = %repo, check_run_id = run.id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        head_sha: &str,
        run: TrackedCheckRun,
        conclusion: Conclusion,
        policy: CompletePolicy,
        view: CheckRunView,
    ) -> Result<TrackedCheckRun> {
        let key = CheckRunKey::new(repo, head_sha);
        let _guard = self.index.lock(&key).await;

        let current = self.tracked_state(&key, run.id).unwrap_or(run.state);
        let next = current.complete(conclusion, policy)?;
        self.transition(token, repo, key, run.id, next, view).await
    }

    /// Ask GitHub to requeue the run. Local state only changes on the events which follow.
    #[instrument(skip(self, token), fields(repo = %repo))]
    pub async fn rerequest(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        check_run_id: i64,
    ) -> Result<()> {
        self.client
            .rerequest_check_run(token, repo, check_run_id)
            .await?;
        info!("check run rerequested");
        Ok(())
    }

    /// The check run tracked for the commit. Falls back to the latest run GitHub lists for the
    /// commit and adopts it into the index. Best effort: another delivery may create a newer run
    /// right after.
    #[instrument(skip(self, token), fields(repo = %repo))]
    pub async fn active(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        head_sha: &str,
    ) -> Result<Option<TrackedCheckRun>> {
        let key = CheckRunKey::new(repo, head_sha);
        let _guard = self.index.lock(&key).await;

        if let Some(run) = self.index.get(&key) {
            return Ok(Some(run));
        }
        debug!("check run is not in the index, listing check runs for the commit");
        let runs = self
            .client
            .list_check_runs_for_ref(token, repo, head_sha, &self.check_run_name)
            .await?;
        let Some(remote) = runs.first() else {
            info!("no check run found for the commit");
            return Ok(None);
        };
        let run = TrackedCheckRun {
            id: remote.id,
            state: remote.state(),
        };
        self.index.insert(key, run);
        info!(check_run_id = run.id, state = %run.state, "adopted check run from GitHub");
        Ok(Some(run))
    }

    fn tracked_state(&self, key: &CheckRunKey, check_run_id: i64) -> Option<CheckRunState> {
        self.index
            .get(key)
            .filter(|t| t.id == check_run_id)
            .map(|t| t.state)
    }

    async fn transition(
        &self,
        token: &InstallationToken,
        repo: &GithubRepository,
        key: CheckRunKey,
        check_run_id: i64,
        next: CheckRunState,
        view: CheckRunView,
    ) -> Result<TrackedCheckRun> {
        let mut input = UpdateCheckRun::to_state(next);
        input.output = view.output;
        input.actions = view.actions;
        self.client
            .update_check_run(token, repo, check_run_id, &input)
            .await?;

        let run = TrackedCheckRun {
            id: check_run_id,
            state: next,
        };
        self.index.update(key, run);
        info!(check_run_id, state = %next, "check run updated");
        Ok(run)
    }
}
