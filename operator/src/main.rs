use anyhow::Result;
use clap::Parser;

mod apps;
mod args;
mod artifacts;
mod util;

use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    manor_common::init();

    let args = Args::parse();

    #[cfg(feature = "metrics")]
    util::metrics::maybe_spawn_metrics_server();

    let client = kube::Client::try_default().await?;

    // Both controllers run in this one manager. Each serializes per object;
    // distinct objects reconcile in parallel.
    tokio::try_join!(
        apps::run(client.clone(), args.clone()),
        artifacts::run(client, args),
    )?;

    Ok(())
}
