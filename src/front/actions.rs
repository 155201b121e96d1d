use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::{
    check_run::{FLAG_OFF_ACTION, FLAG_ON_ACTION},
    events::GithubRepository,
    github_client::{CommitState, CreateCommitStatus, GithubClient},
    github_token::InstallationToken,
};

/// The check run button a user clicked, with what is needed to act on its commit.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub repository: GithubRepository,
    pub head_sha: String,
    pub check_run_id: i64,
    pub delivery_id: String,
    pub token: InstallationToken,
}

/// Handler of one `requested_action` identifier.
#[allow(clippy::indexing_slicing)] // For automock.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestedAction: Send + Sync {
    async fn handle(&self, req: &ActionRequest) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn RequestedAction>>,
}

impl ActionRegistry {
    /// Registry with the built-in `turn_on` and `turn_off` flag handlers.
    pub fn with_flag_actions<GH: GithubClient + 'static>(
        client: &Arc<GH>,
        check_run_name: &str,
    ) -> Self {
        let context = format!("{check_run_name}/flag");
        let mut registry = Self::default();
        registry.register(
            FLAG_ON_ACTION,
            FlagAction::new(Arc::clone(client), context.clone(), CommitState::Success),
        );
        registry.register(
            FLAG_OFF_ACTION,
            FlagAction::new(Arc::clone(client), context, CommitState::Failure),
        );
        registry
    }

    /// Register `action` for `identifier`, replacing any previous handler.
    pub fn register<A: RequestedAction + 'static>(&mut self, identifier: &str, action: A) {
        self.actions.insert(identifier.to_owned(), Arc::new(action));
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<dyn RequestedAction>> {
        self.actions.get(identifier).map(Arc::clone)
    }
}

/// Mirrors a flag as a commit status on the check run's commit.
pub struct FlagAction<GH: GithubClient> {
    client: Arc<GH>,
    context: String,
    state: CommitState,
}

impl<GH: GithubClient> FlagAction<GH> {
    pub fn new(client: Arc<GH>, context: String, state: CommitState) -> Self {
        Self {
            client,
            context,
            state,
        }
    }
}

#[async_trait]
impl<GH: GithubClient> RequestedAction for FlagAction<GH> {
    async fn handle(&self, req: &ActionRequest) -> Result<()> {
        let description = match self.state {
            CommitState::Success => "Flag is on",
            CommitState::Failure | CommitState::Error => "Flag is off",
            CommitState::Pending => "Flag is pending",
        };
        let input = CreateCommitStatus {
            state: self.state,
            description: description.to_owned(),
            context: self.context.clone(),
            target_url: None,
        };
        self.client
            .create_commit_status(&req.token, &req.repository, &req.head_sha, &input)
            .await?;
        info!(context = self.context, state = %self.state, "flag commit status set");
        Ok(())
    }
}
