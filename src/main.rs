use std::process::ExitCode;

use anyhow::Result;

use status_checker::cli::run;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    run().await
}
