use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use manor_types::{Artifact, ArtifactConditionType};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::args::Args;
use crate::util::{
    BUILD_PROBE_INTERVAL, Error, RECONCILE_TIMEOUT, REQUEUE_NOW,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `Artifact` controller.
pub async fn run(client: Client, args: Args) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Artifact controller...".green());

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), args));

    // Namespace where we run leader election.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("manor-artifact-controller-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "manor-artifact-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        manor_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    manor_common::signal_ready();
    // We run indefinitely; only the leader runs the controller.
    // On leadership loss, we abort the controller and go back to standby.
    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted Artifact controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!(
                    "{}",
                    "👑 Acquired leadership; starting Artifact controller".green()
                );
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Artifact controller started.".green());
                    Controller::new(
                        Api::<Artifact>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<Secret>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(Api::<Pod>::all(client_for_controller), Default::default())
                    .run(reconcile, on_error, context_for_controller)
                    .for_each(|_res| async move {})
                    .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping Artifact controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with. Required for K8S resource management.
    client: Client,

    /// Reconciler configuration: docker host, default registry, builder image.
    args: Args,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (ArtifactAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, args: Args) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                args,
                metrics: ControllerMetrics::new("artifact_controller"),
                last_action: Mutex::new(HashMap::new()),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                args,
                last_action: Mutex::new(HashMap::new()),
            }
        }
    }
}

/// Action to be taken upon an `Artifact` resource during reconciliation.
#[derive(Debug, PartialEq, Clone)]
enum ArtifactAction {
    /// Record the Initialized condition on a freshly observed Artifact.
    Initialize,

    /// Create the credentials secret consumed by the build pod.
    CreateSecret,

    /// Create the build pod wired to the credentials secret.
    CreatePod,

    /// The build pod reached a terminal phase; record Completed.
    Complete,

    /// The build pod exists but has not reported Ready yet.
    AwaitReady,

    /// The build pod is Ready; record the In progress condition.
    MarkInProgress,

    /// The build already carries its terminal condition; nothing to do.
    Settled,

    /// Conditions are up-to-date and the build is still running.
    NoOp,

    Requeue(Duration),
}

impl ArtifactAction {
    fn to_str(&self) -> &str {
        match self {
            ArtifactAction::Initialize => "Initialize",
            ArtifactAction::CreateSecret => "CreateSecret",
            ArtifactAction::CreatePod => "CreatePod",
            ArtifactAction::Complete => "Complete",
            ArtifactAction::AwaitReady => "AwaitReady",
            ArtifactAction::MarkInProgress => "MarkInProgress",
            ArtifactAction::Settled => "Settled",
            ArtifactAction::NoOp => "NoOp",
            ArtifactAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `Artifact` resource.
async fn reconcile(instance: Arc<Artifact>, context: Arc<ContextData>) -> Result<Action, Error> {
    // Downstream cluster calls inherit this deadline; an invocation that
    // overruns it fails and is retried by the workqueue.
    tokio::time::timeout(RECONCILE_TIMEOUT, reconcile_inner(instance, context)).await?
}

async fn reconcile_inner(
    instance: Arc<Artifact>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected Artifact resource to be namespaced. Can't build in an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };

    let name = instance.name_any();

    // Re-read the Artifact instead of trusting the cached copy. The condition
    // machine is append-only and must not duplicate entries off a stale status.
    let api: Api<Artifact> = Api::namespaced(client.clone(), &namespace);
    let instance = match api.get(&name).await {
        Ok(instance) => instance,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(Action::await_change()),
        Err(e) => return Err(e.into()),
    };

    // Increment total number of reconciles for the Artifact resource.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    // Benchmark the read phase of reconciliation.
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let action = determine_action(client.clone(), &namespace, &instance).await?;

    if action != ArtifactAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.clone(), Instant::now()),
            )
        };
        if let Some((last_action, last_instant)) = value
            && (Some(&action) != Some(&last_action)
                || last_instant.elapsed() > Duration::from_secs(300))
        {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{:?}", action).color(FG2),
            );
        }
    }

    // Report the read phase performance.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    // Increment the counter for the action.
    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    // Benchmark the write phase of reconciliation.
    #[cfg(feature = "metrics")]
    let timer = match action {
        // Don't measure performance for NoOp actions.
        ArtifactAction::NoOp => None,
        // Start a performance timer for the write phase.
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    // Performs action as decided by the `determine_action` function.
    // This is the write phase of reconciliation.
    let result = match action {
        ArtifactAction::Requeue(duration) => Action::requeue(duration),
        ArtifactAction::Initialize => {
            actions::initialize(client, &instance).await?;
            // The status write triggers another event; no requeue needed.
            Action::await_change()
        }
        ArtifactAction::CreateSecret => {
            actions::create_secret(client, &instance).await?;
            Action::requeue(REQUEUE_NOW)
        }
        ArtifactAction::CreatePod => {
            actions::create_pod(client, &instance, &context.args).await?;
            Action::requeue(REQUEUE_NOW)
        }
        ArtifactAction::Complete => {
            actions::complete(client, &instance).await?;
            Action::await_change()
        }
        ArtifactAction::AwaitReady => Action::requeue(REQUEUE_NOW),
        ArtifactAction::MarkInProgress => {
            actions::mark_in_progress(client, &instance).await?;
            Action::await_change()
        }
        ArtifactAction::Settled => Action::await_change(),
        ArtifactAction::NoOp => Action::requeue(BUILD_PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Looks at the state of the given `Artifact` and of its owned children and
/// decides which action needs to be performed. The finite set of possible
/// actions is represented by the `ArtifactAction` enum.
async fn determine_action(
    client: Client,
    namespace: &str,
    instance: &Artifact,
) -> Result<ArtifactAction, Error> {
    // Don't do anything while being deleted.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(ArtifactAction::Requeue(Duration::from_secs(2)));
    }

    // An Artifact without a target App can never make progress; requeueing
    // won't help until the user edits the resource.
    if instance.spec.app.is_empty() {
        return Err(Error::UserInput(
            "spec.app cannot be empty, not requeueing".to_owned(),
        ));
    }

    // A fresh Artifact gets its first condition before any children exist.
    if instance
        .status
        .as_ref()
        .is_none_or(|status| status.conditions.is_empty())
    {
        return Ok(ArtifactAction::Initialize);
    }

    let secret = get_secret(
        client.clone(),
        namespace,
        &actions::secret_name(&instance.spec.app),
    )
    .await?;
    let pod = get_pod(client, namespace, &actions::pod_name(&instance.spec.app)).await?;

    classify(instance, secret.as_ref(), pod.as_ref())
}

/// The pure core of the read phase: given the freshest Artifact and its
/// children, pick the next action.
fn classify(
    instance: &Artifact,
    secret: Option<&Secret>,
    pod: Option<&Pod>,
) -> Result<ArtifactAction, Error> {
    if instance.spec.app.is_empty() {
        return Err(Error::UserInput(
            "spec.app cannot be empty, not requeueing".to_owned(),
        ));
    }

    if instance
        .status
        .as_ref()
        .is_none_or(|status| status.conditions.is_empty())
    {
        return Ok(ArtifactAction::Initialize);
    }

    if secret.is_none() {
        return Ok(ArtifactAction::CreateSecret);
    }

    let Some(pod) = pod else {
        return Ok(ArtifactAction::CreatePod);
    };

    // A terminal pod marks the build Completed whether it succeeded or
    // failed; the condition records that the build ran, not its outcome.
    if pod_is_terminal(pod) {
        return Ok(
            if instance.has_condition(ArtifactConditionType::Completed) {
                ArtifactAction::Settled
            } else {
                ArtifactAction::Complete
            },
        );
    }

    if !pod_is_ready(pod) {
        return Ok(ArtifactAction::AwaitReady);
    }

    if !instance.has_condition(ArtifactConditionType::InProgress) {
        return Ok(ArtifactAction::MarkInProgress);
    }

    Ok(ArtifactAction::NoOp)
}

fn pod_is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

async fn get_pod(client: Client, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn get_secret(client: Client, namespace: &str, name: &str) -> Result<Option<Secret>, Error> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(secret) => Ok(Some(secret)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Invalid user input is surfaced without a requeue; everything else is
/// retried after five seconds.
fn on_error(instance: Arc<Artifact>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} {:?}", error, instance).red()
    );
    match error {
        Error::UserInput(_) => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}
