use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    response::{IntoResponse, Response},
    routing::post,
};
use manor_common::response;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::args::Args;
use crate::pipeline;
use crate::unpack::{self, UnpackError};

/// Shared server state.
#[derive(Clone)]
struct BuildState {
    args: Arc<Args>,
    /// One-shot admission latch: at most one build per process lifetime.
    started: Arc<AtomicBool>,
    /// Set when the single build fails; decides the process exit code.
    failed: Arc<AtomicBool>,
    /// Cancelled when the build finishes either way; drains the listener.
    done: CancellationToken,
}

impl BuildState {
    /// Records a failed build and starts draining the server, handing the
    /// response back to the one client that was admitted.
    fn fail(&self, response: Response) -> Response {
        self.failed.store(true, Ordering::SeqCst);
        self.done.cancel();
        response
    }
}

/// Serves `POST /build` until the single admitted build finishes, then
/// drains. Returns an error if that build failed.
pub async fn run_server(args: Args) -> Result<()> {
    let done = CancellationToken::new();
    let state = BuildState {
        args: Arc::new(args.clone()),
        started: Arc::new(AtomicBool::new(false)),
        failed: Arc::new(AtomicBool::new(false)),
        done: done.clone(),
    };

    let app = Router::new()
        .route("/build", post(build_handler))
        // Source archives are arbitrarily large.
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(axum::middleware::from_fn(
            manor_common::access_log::internal,
        ))
        .with_state(state.clone());

    let addr: SocketAddr = normalize_addr(&args.addr)
        .parse()
        .context("invalid listen address")?;
    tracing::info!(%addr, "starting build server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { done.cancelled().await })
        .await?;

    if state.failed.load(Ordering::SeqCst) {
        anyhow::bail!("build pipeline failed");
    }
    tracing::info!("build server drained");
    Ok(())
}

/// The ":8081" form binds all interfaces.
fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

/// Receives a gzip-compressed tar archive of the source tree, unpacks it,
/// runs the build pipeline and streams the merged tool output back on the
/// open response body.
async fn build_handler(State(state): State<BuildState>, body: Bytes) -> Response {
    // Single-entry gate: the pod is the build unit, so the second caller
    // short-circuits without touching the pipeline.
    if state.started.swap(true, Ordering::SeqCst) {
        return response::conflict(anyhow!("a build was already accepted by this pod"));
    }

    tracing::info!("receiving source...");

    let build_dir = state.args.build_dir.clone();
    match tokio::task::spawn_blocking(move || unpack::unpack_source(&body[..], &build_dir)).await {
        Ok(Ok(())) => {}
        Ok(Err(e @ UnpackError::Malformed(_))) => return state.fail(response::bad_request(e)),
        Ok(Err(e)) => return state.fail(response::internal_server_error(e)),
        Err(e) => return state.fail(response::internal_server_error(anyhow!(e))),
    }

    // The response streams each output chunk as its own frame, so the
    // client sees build progress live.
    let (tx, rx) = tokio::sync::mpsc::channel::<io::Result<Bytes>>(64);
    tokio::spawn(run_pipeline(state, tx));
    Body::from_stream(ReceiverStream::new(rx)).into_response()
}

async fn run_pipeline(state: BuildState, tx: tokio::sync::mpsc::Sender<io::Result<Bytes>>) {
    let args = &state.args;
    let image = pipeline::image_ref(&args.image_registry, &args.app_namespace, &args.app_name);
    match pipeline::build_and_push(&image, &args.build_dir, &tx).await {
        Ok(()) => tracing::info!(%image, "build complete"),
        Err(e) => {
            // The status line is already on the wire; the stream is
            // terminated instead and the process exit code carries the
            // failure to the reconciler.
            tracing::error!(error = format!("{:#}", e), "build pipeline failed");
            state.failed.store(true, Ordering::SeqCst);
            let _ = tx.send(Err(io::Error::other(format!("{:#}", e)))).await;
        }
    }
    state.done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::path::PathBuf;

    fn test_state(build_dir: PathBuf) -> BuildState {
        BuildState {
            args: Arc::new(Args {
                addr: ":8081".to_string(),
                build_dir,
                token: String::new(),
                app_namespace: "ns".to_string(),
                app_name: "web".to_string(),
                image_registry: "r.local".to_string(),
            }),
            started: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            done: CancellationToken::new(),
        }
    }

    #[test]
    fn colon_addresses_bind_all_interfaces() {
        assert_eq!(normalize_addr(":8081"), "0.0.0.0:8081");
        assert_eq!(normalize_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn second_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path().to_path_buf());

        // First request claims the latch (and fails on the garbage body).
        let first = build_handler(State(state.clone()), Bytes::from_static(b"not gzip")).await;
        assert_eq!(first.status(), StatusCode::BAD_REQUEST);

        // The latch is consumed: no second build is ever started.
        let second = build_handler(State(state.clone()), Bytes::from_static(b"not gzip")).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn malformed_archive_fails_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path().to_path_buf());

        let response = build_handler(State(state.clone()), Bytes::from_static(b"not gzip")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(state.failed.load(Ordering::SeqCst));
        assert!(state.done.is_cancelled());
    }
}
