use anyhow::{Result, bail};
use clap::Parser;
use std::time::Duration;

mod args;
mod pipeline;
mod server;
mod unpack;

use args::Args;

/// Hard deadline for the whole build process.
const BUILD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    manor_common::init();

    tracing_subscriber::fmt::init();

    let args = Args::parse();
    tracing::info!(build_dir = %args.build_dir.display(), "build dir");
    // The token is stored for a future admission scheme; it is not checked.
    tracing::debug!(token_len = args.token.len(), "credentials token loaded");

    let server = tokio::spawn(server::run_server(args.clone()));

    tokio::select! {
        _ = manor_common::shutdown::shutdown_signal() => {
            tracing::info!("terminating...");
            tokio::fs::remove_dir_all(&args.build_dir).await.ok();
        }
        _ = tokio::time::sleep(BUILD_TIMEOUT) => {
            tokio::fs::remove_dir_all(&args.build_dir).await.ok();
            bail!("build timed out");
        }
        result = server => {
            // The server drains itself after its single build; a failed
            // pipeline surfaces here and exits the process non-zero.
            result??;
        }
    }

    Ok(())
}
