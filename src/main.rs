use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    let cli = confluence_exporter::cli::Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    confluence_exporter::logging::init(default_level).context("init logging")?;
    tracing::debug!(?cli, "parsed cli");

    confluence_exporter::pipeline::run(cli).await
}
