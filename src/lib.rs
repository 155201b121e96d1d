pub mod cli;
pub mod events;

mod app_error;
mod app_token;
mod check_run;
mod front;
mod github_client;
mod github_config;
mod github_token;
mod github_verifier;
mod trace;
