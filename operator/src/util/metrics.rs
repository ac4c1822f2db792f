use std::convert::Infallible;
use std::sync::OnceLock;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use owo_colors::OwoColorize;
use prometheus::{HistogramVec, IntCounterVec, TextEncoder};

static SERVER_STARTED: OnceLock<()> = OnceLock::new();

/// Per-controller reconcile instrumentation, registered in the process-wide
/// default registry under a controller-specific metric prefix.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = prometheus::register_int_counter_vec!(
            format!("manor_{}_reconciles_total", controller),
            "Total number of reconcile invocations",
            &["name", "namespace"]
        )
        .expect("register reconcile counter");
        let action_counter = prometheus::register_int_counter_vec!(
            format!("manor_{}_actions_total", controller),
            "Reconcile actions by outcome",
            &["name", "namespace", "action"]
        )
        .expect("register action counter");
        let read_histogram = prometheus::register_histogram_vec!(
            format!("manor_{}_read_phase_seconds", controller),
            "Duration of the read phase of reconciliation",
            &["name", "namespace", "action"]
        )
        .expect("register read histogram");
        let write_histogram = prometheus::register_histogram_vec!(
            format!("manor_{}_write_phase_seconds", controller),
            "Duration of the write phase of reconciliation",
            &["name", "namespace", "action"]
        )
        .expect("register write histogram");
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

/// Start the /metrics endpoint if METRICS_PORT is set. Idempotent.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };

    // Exit the process with a non-zero code when any thread panics, so the
    // container restarts instead of limping along without a controller.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        tokio::spawn(run_metrics_server(port));
    }
}

pub async fn run_metrics_server(port: u16) {
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!(
                "{}",
                format!("🛑 Failed to bind metrics server to port {}: {}", port, e).red()
            );
            std::process::exit(1);
        }
    };
    println!(
        "{}{}",
        "📈 Starting metrics server • port=".green(),
        format!("{}", port).green().dimmed(),
    );
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("{}", format!("metrics server accept failed: {}", e).red());
                continue;
            }
        };
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let service = service_fn(|req| async move {
                Ok::<_, Infallible>(match req.uri().path() {
                    "/metrics" => render_metrics(),
                    "/healthz" | "/readyz" => Response::new(Full::new(Bytes::from_static(b"ok"))),
                    _ => {
                        let mut resp = Response::new(Full::new(Bytes::new()));
                        *resp.status_mut() = StatusCode::NOT_FOUND;
                        resp
                    }
                })
            });
            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(io, service);
            if let Err(e) = conn.await {
                eprintln!("{}", format!("metrics connection error: {}", e).red());
            }
        });
    }
}

fn render_metrics() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => Response::new(Full::new(Bytes::from(body))),
        Err(e) => {
            let mut resp = Response::new(Full::new(Bytes::from(format!("{}", e))));
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        }
    }
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
}
