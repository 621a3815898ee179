use anyhow::Context as _;

use crate::cli::Cli;

/// One CLI invocation: fetch (unless `--no-fetch`), then convert.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let fetch_args = cli.fetch_args();
    let convert_args = cli.convert_args();

    if cli.no_fetch {
        tracing::info!(out = %convert_args.out.display(), "pipeline: fetch skipped");
    } else {
        tracing::info!(
            url = %fetch_args.url,
            out = %fetch_args.out.display(),
            space = fetch_args.space.as_deref().unwrap_or("*"),
            "pipeline: fetch"
        );
        crate::fetch::run(fetch_args).await.context("fetch")?;
    }

    tracing::info!("pipeline: convert");
    crate::convert::run(convert_args).context("convert")?;

    Ok(())
}
