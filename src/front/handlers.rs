mod health_check;
mod webhook;

pub use health_check::health_check;
pub use webhook::webhook;

use crate::{
    check_run::CiJob,
    front::{config::FrontConfig, deliveries::DeliveryLog, router::EventRouter},
    github_client::GithubClient,
    github_token::TokenFetcher,
};

pub struct AppState<GH: GithubClient, F: TokenFetcher, J: CiJob> {
    pub config: FrontConfig,
    pub router: EventRouter<GH, F, J>,
    pub deliveries: DeliveryLog,
}
