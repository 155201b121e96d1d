use std::{future::pending, io, sync::Arc};

use axum::{Router, ServiceExt, body::Body, serve};
use clap::Args;
use http::Request;
use tokio::{net::TcpListener, signal};
use tower_http::normalize_path::NormalizePath;
use tracing::{error, info};

use crate::{
    app_token::AppAuthenticator,
    check_run::{CommandJob, JobConfig},
    cli::{Cli, CommandResult, SUCCESS, app_info::authenticate},
    front::{ActionRegistry, AppState, DeliveryLog, EventRouter, FrontConfig, build_app},
    github_client::RestClient,
    github_config::{GithubApiConfig, GithubAppConfig},
    github_token::InstallationTokenExchanger,
    trace::init_tracing,
};

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    github_app_config: GithubAppConfig,
    #[command(flatten)]
    github_config: GithubApiConfig,
    #[command(flatten)]
    config: FrontConfig,
    #[command(flatten)]
    job_config: JobConfig,
    /// The address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,
    /// The port to listen on.
    #[arg(long, default_value = "3000")]
    port: u16,
    /// How long running jobs may take to finish after a shutdown signal.
    #[arg(long, env, default_value = "5m")]
    shutdown_grace: humantime::Duration,
}

pub async fn server(cli: Cli, args: ServerArgs) -> CommandResult {
    init_tracing(&cli.verbose, cli.log_format);
    let ServerArgs {
        github_app_config,
        github_config,
        config,
        job_config,
        address,
        port,
        shutdown_grace,
    } = args;

    let authenticator = Arc::new(AppAuthenticator::from_config(&github_app_config)?);
    let client = Arc::new(RestClient::new(&github_config)?);
    authenticate(client.as_ref(), &authenticator).await?;

    let tokens = InstallationTokenExchanger::new(Arc::clone(&client), Arc::clone(&authenticator));
    let actions = ActionRegistry::with_flag_actions(&client, &config.check_run_name);
    let router = EventRouter::new(
        authenticator.app_id(),
        &config,
        client,
        tokens,
        CommandJob::new(&job_config),
        job_config.job_timeout,
        actions,
    );
    let state = Arc::new(AppState {
        deliveries: DeliveryLog::new(
            config.delivery_dedup_capacity,
            config.delivery_dedup_ttl.into(),
        ),
        config,
        router,
    });
    let app = build_app(Arc::clone(&state));
    let app = <NormalizePath<Router> as ServiceExt<Request<Body>>>::into_make_service(app);

    let listener = TcpListener::bind([address, port.to_string()].join(":")).await?;
    info!("listening on {}", listener.local_addr()?);
    serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Check runs of aborted jobs stay in progress until rerequested.
    state.router.jobs().wait(shutdown_grace.into()).await;
    info!("server stopped");

    SUCCESS
}

async fn shutdown_signal() {
    match wait_for_signal().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!("failed to listen for shutdown signals: {e}");
            pending::<()>().await;
        }
    }
}

async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
