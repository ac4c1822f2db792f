use std::io;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc::Sender;

/// Builder image every build runs with.
const BUILDER_IMAGE: &str = "paketobuildpacks/builder:full";

/// The image name a build produces and publishes.
pub fn image_ref(registry: &str, namespace: &str, name: &str) -> String {
    format!("{}/{}/{}", registry, namespace, name)
}

/// Runs the builder and then the publisher, streaming their merged output
/// to `tx` chunk by chunk. The publisher finds DOCKER_HOST in the inherited
/// environment.
pub async fn build_and_push(
    image: &str,
    build_dir: &Path,
    tx: &Sender<io::Result<Bytes>>,
) -> Result<()> {
    tracing::info!(%image, "building...");
    let mut build = Command::new("pack");
    build
        .arg("build")
        .arg(image)
        .arg("--builder")
        .arg(BUILDER_IMAGE)
        .current_dir(build_dir);
    run_tool("pack", build, tx).await?;

    tracing::info!(%image, "pushing...");
    let mut push = Command::new("docker");
    push.arg("push").arg(image);
    run_tool("docker", push, tx).await?;

    Ok(())
}

/// Runs one tool to completion, mirroring its stdout and stderr to this
/// process's own streams and forwarding every chunk to `tx`.
async fn run_tool(tool: &str, mut command: Command, tx: &Sender<io::Result<Bytes>>) -> Result<()> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", tool))?;
    let stdout = child
        .stdout
        .take()
        .with_context(|| format!("{} has no stdout pipe", tool))?;
    let stderr = child
        .stderr
        .take()
        .with_context(|| format!("{} has no stderr pipe", tool))?;

    let (out, err, status) = tokio::join!(
        pump(stdout, tokio::io::stdout(), tx.clone()),
        pump(stderr, tokio::io::stderr(), tx.clone()),
        child.wait(),
    );
    out?;
    err?;

    let status = status.with_context(|| format!("failed to wait for {}", tool))?;
    if !status.success() {
        bail!("{} exited with {}", tool, status);
    }
    Ok(())
}

async fn pump<R, W>(mut reader: R, mut mirror: W, tx: Sender<io::Result<Bytes>>) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        mirror.write_all(&buf[..n]).await?;
        // A dropped receiver means the client went away; keep draining so
        // the tool never blocks on a full pipe.
        let _ = tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await;
    }
    Ok(())
}
