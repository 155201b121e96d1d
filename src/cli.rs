mod app_info;
mod server;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use crate::trace::LogFormat;

pub type CommandResult = anyhow::Result<ExitCode>;

pub const SUCCESS: CommandResult = Ok(ExitCode::SUCCESS);

#[allow(clippy::partial_pub_fields)] // To use global options.
#[derive(Debug, Clone, Parser)]
#[command(version, about, args_override_self(true))]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
    /// Format of log output.
    #[arg(long, env, global = true, value_enum, default_value_t)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run the GitHub App webhook server.
    Server(server::ServerArgs),
    /// Print metadata of the GitHub App the configured credential belongs to.
    AppInfo(app_info::AppInfoArgs),
}

pub async fn run() -> CommandResult {
    let cli = Cli::parse();
    let cli_clone = cli.clone();
    match cli.command {
        // Pass Cli to use global options.
        Commands::Server(args) => server::server(cli_clone, args).await,
        Commands::AppInfo(args) => app_info::app_info(cli_clone, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
