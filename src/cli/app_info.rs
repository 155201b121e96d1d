use anyhow::{Context as _, Result};
use clap::Args;
use tracing::info;

use crate::{
    app_token::AppAuthenticator,
    cli::{Cli, CommandResult, SUCCESS},
    github_client::{AppMetadata, GithubClient, RestClient},
    github_config::{GithubApiConfig, GithubAppConfig},
    trace::init_tracing,
};

#[derive(Debug, Clone, Args)]
pub struct AppInfoArgs {
    #[command(flatten)]
    github_app_config: GithubAppConfig,
    #[command(flatten)]
    github_config: GithubApiConfig,
}

pub async fn app_info(cli: Cli, args: AppInfoArgs) -> CommandResult {
    init_tracing(&cli.verbose, cli.log_format);

    let authenticator = AppAuthenticator::from_config(&args.github_app_config)?;
    let client = RestClient::new(&args.github_config)?;
    let app = authenticate(&client, &authenticator).await?;
    println!("{}", serde_json::to_string_pretty(&app)?);

    SUCCESS
}

/// Fetch the metadata of the app the credential belongs to. Fails fast on a wrong app ID or key.
pub async fn authenticate<GH: GithubClient>(
    client: &GH,
    authenticator: &AppAuthenticator,
) -> Result<AppMetadata> {
    let token = authenticator.app_token()?;
    let app = client.get_app_metadata(&token).await.with_context(|| {
        format!(
            "failed to authenticate as app: app_id={}",
            authenticator.app_id()
        )
    })?;
    info!(
        app_id = app.id,
        slug = app.slug.as_deref().unwrap_or_default(),
        "authenticated as {}",
        app.name
    );
    Ok(app)
}
