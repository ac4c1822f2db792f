use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::{
    Api, ResourceExt,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use manor_types::App;
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::args::Args;
use crate::util::{
    APP_PROBE_INTERVAL, Error, RECONCILE_TIMEOUT, REGISTRY_RETRY_INTERVAL, REQUEUE_NOW,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `App` controller.
pub async fn run(client: Client, args: Args) -> Result<(), Error> {
    println!("{}", "⚙️ Starting App controller...".green());

    // Preparation of resources used by the `kube_runtime::Controller`
    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), args));

    // Namespace where we run leader election.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("manor-app-controller-{}", uuid::Uuid::new_v4()));
    // The shared lock name across all replicas
    let lease_name = "manor-app-controller-lock".to_string();
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
                    eprintln!("aborted App controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!(
                    "{}",
                    "👑 Acquired leadership; starting App controller".green()
                );
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 App controller started.".green());
                    Controller::new(
                        Api::<App>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<Deployment>::all(client_for_controller.clone()),
                        Default::default(),
                    )
                    .owns(
                        Api::<Service>::all(client_for_controller),
                        Default::default(),
                    )
                    .run(reconcile, on_error, context_for_controller)
                    .for_each(|_res| async move {})
                    .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping App controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` method invocation.
struct ContextData {
    /// Kubernetes client to make Kubernetes API requests with. Required for K8S resource management.
    client: Client,

    /// Reconciler configuration: default registry and friends.
    args: Args,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (AppAction, Instant)>>,
}

impl ContextData {
    pub fn new(client: Client, args: Args) -> Self {
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                args,
                metrics: ControllerMetrics::new("app_controller"),
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

/// Action to be taken upon an `App` resource during reconciliation.
#[derive(Debug, PartialEq, Clone)]
enum AppAction {
    /// The Deployment named after the App does not exist yet.
    CreateDeployment { registry: String },

    /// A compared Deployment field diverged; update it in place.
    UpdateDeployment { registry: String, reason: String },

    /// The Service named after the App does not exist yet.
    CreateService,

    /// The Service selector diverged. Selectors are immutable on many
    /// orchestrators, so the Service is deleted and recreated.
    RecreateService { reason: String },

    /// A compared Service port field diverged; update it in place.
    UpdateService { reason: String },

    /// The image-registry Service has not appeared yet.
    AwaitRegistry,

    /// The App is in desired state and requires no actions to be taken.
    NoOp,

    Requeue(Duration),
}

impl AppAction {
    fn to_str(&self) -> &str {
        match self {
            AppAction::CreateDeployment { .. } => "CreateDeployment",
            AppAction::UpdateDeployment { .. } => "UpdateDeployment",
            AppAction::CreateService => "CreateService",
            AppAction::RecreateService { .. } => "RecreateService",
            AppAction::UpdateService { .. } => "UpdateService",
            AppAction::AwaitRegistry => "AwaitRegistry",
            AppAction::NoOp => "NoOp",
            AppAction::Requeue(_) => "Requeue",
        }
    }
}

/// Reconciliation function for the `App` resource.
async fn reconcile(instance: Arc<App>, context: Arc<ContextData>) -> Result<Action, Error> {
    // Downstream cluster calls inherit this deadline; an invocation that
    // overruns it fails and is retried by the workqueue.
    tokio::time::timeout(RECONCILE_TIMEOUT, reconcile_inner(instance, context)).await?
}

async fn reconcile_inner(instance: Arc<App>, context: Arc<ContextData>) -> Result<Action, Error> {
    // The `Client` is shared -> a clone from the reference is obtained
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::UserInput(
                "Expected App resource to be namespaced. Can't deploy to an unknown namespace."
                    .to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };

    // Name of the App resource is used to name the subresources as well.
    let name = instance.name_any();

    // Re-read the App rather than trusting the cached copy.
    let api: Api<App> = Api::namespaced(client.clone(), &namespace);
    let instance = match api.get(&name).await {
        Ok(instance) => instance,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(Action::await_change()),
        Err(e) => return Err(e.into()),
    };

    // Increment total number of reconciles for the App resource.
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
    let action = determine_action(client.clone(), &namespace, &instance, &context.args).await?;

    if action != AppAction::NoOp {
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
        AppAction::NoOp => None,
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
        AppAction::Requeue(duration) => Action::requeue(duration),
        AppAction::CreateDeployment { registry } => {
            actions::create_deployment(client, &instance, &registry).await?;
            Action::requeue(REQUEUE_NOW)
        }
        AppAction::UpdateDeployment { registry, reason } => {
            actions::update_deployment(client, &instance, &registry, reason).await?;
            Action::requeue(REQUEUE_NOW)
        }
        AppAction::CreateService => {
            actions::create_service(client, &instance).await?;
            Action::requeue(REQUEUE_NOW)
        }
        AppAction::RecreateService { reason } => {
            actions::recreate_service(client, &instance, reason).await?;
            Action::requeue(REQUEUE_NOW)
        }
        AppAction::UpdateService { reason } => {
            actions::update_service(client, &instance, reason).await?;
            Action::requeue(REQUEUE_NOW)
        }
        AppAction::AwaitRegistry => Action::requeue(REGISTRY_RETRY_INTERVAL),
        AppAction::NoOp => Action::requeue(APP_PROBE_INTERVAL),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

enum ResolvedRegistry {
    Registry(String),
    /// The `.svc` reference points at a Service that does not exist yet.
    Wait,
}

/// Resolves the effective image registry for the App. A value ending in
/// `.svc` is a cluster-DNS-style reference `<service>.<namespace>.svc`; the
/// registry is rewritten to `127.0.0.1:<nodePort>` of that Service.
async fn resolve_image_registry(
    client: Client,
    instance: &App,
    args: &Args,
) -> Result<ResolvedRegistry, Error> {
    let registry = instance
        .spec
        .image_registry
        .clone()
        .unwrap_or_else(|| args.default_image_registry.clone());

    let Some((service_name, service_namespace)) = svc_registry_parts(&registry)? else {
        return Ok(ResolvedRegistry::Registry(registry));
    };

    let api: Api<Service> = Api::namespaced(client, &service_namespace);
    match api.get(&service_name).await {
        Ok(service) => Ok(ResolvedRegistry::Registry(node_port_registry(&service))),
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            println!("Image registry '{}' not found, retrying...", registry);
            Ok(ResolvedRegistry::Wait)
        }
        Err(e) => Err(e.into()),
    }
}

/// Splits a `.svc`-suffixed registry into (service, namespace). Anything
/// other than exactly `<name>.<namespace>.svc` is a user error.
fn svc_registry_parts(registry: &str) -> Result<Option<(String, String)>, Error> {
    if !registry.ends_with(".svc") {
        return Ok(None);
    }
    let split: Vec<&str> = registry.split('.').collect();
    if split.len() != 3 {
        return Err(Error::UserInput(format!(
            "image registry {:?} is not in the format <name>.<namespace>.svc",
            registry
        )));
    }
    Ok(Some((split[0].to_string(), split[1].to_string())))
}

/// Rewrites the registry to the node-mapped address of the Service, using
/// the first port that carries a non-zero node port.
fn node_port_registry(service: &Service) -> String {
    let node_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find_map(|p| p.node_port.filter(|node_port| *node_port != 0))
        })
        .unwrap_or(0);
    format!("127.0.0.1:{}", node_port)
}

/// Looks at the state of the given `App` and of its owned children and
/// decides which action needs to be performed.
async fn determine_action(
    client: Client,
    namespace: &str,
    instance: &App,
    args: &Args,
) -> Result<AppAction, Error> {
    // Don't do anything while being deleted.
    if instance.metadata.deletion_timestamp.is_some() {
        return Ok(AppAction::Requeue(Duration::from_secs(2)));
    }

    let registry = match resolve_image_registry(client.clone(), instance, args).await? {
        ResolvedRegistry::Registry(registry) => registry,
        ResolvedRegistry::Wait => return Ok(AppAction::AwaitRegistry),
    };

    let name = instance.name_any();

    let desired_deployment = actions::deployment_resource(instance, &registry)?;
    let Some(current_deployment) = get_deployment(client.clone(), namespace, &name).await? else {
        return Ok(AppAction::CreateDeployment { registry });
    };
    if let Some(reason) = deployment_needs_update(&desired_deployment, &current_deployment) {
        return Ok(AppAction::UpdateDeployment { registry, reason });
    }

    let desired_service = actions::service_resource(instance)?;
    let Some(current_service) = get_service(client, namespace, &name).await? else {
        return Ok(AppAction::CreateService);
    };
    if let Some(reason) = service_needs_recreate(&desired_service, &current_service) {
        return Ok(AppAction::RecreateService { reason });
    }
    if let Some(reason) = service_needs_update(&desired_service, &current_service) {
        return Ok(AppAction::UpdateService { reason });
    }

    Ok(AppAction::NoOp)
}

fn deployment_containers(deployment: &Deployment) -> &[k8s_openapi::api::core::v1::Container] {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod_spec| pod_spec.containers.as_slice())
        .unwrap_or(&[])
}

/// Nil and empty sequences compare equal: the cluster normalizes away empty
/// command/args lists.
fn slices_match(a: Option<&[String]>, b: Option<&[String]>) -> bool {
    a.unwrap_or(&[]) == b.unwrap_or(&[])
}

/// Whether the current Deployment diverges from the desired one on any of
/// the compared fields: replica count, container count, container[0] image,
/// image pull policy, command, args. Drift anywhere else (env vars,
/// resources, labels) is not a trigger.
fn deployment_needs_update(desired: &Deployment, current: &Deployment) -> Option<String> {
    let desired_replicas = desired.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let current_replicas = current.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    if desired_replicas != current_replicas {
        return Some(format!(
            "current number of replicas {} doesn't match desired {}",
            current_replicas, desired_replicas
        ));
    }

    let desired_containers = deployment_containers(desired);
    let current_containers = deployment_containers(current);
    if desired_containers.len() != current_containers.len() {
        return Some(format!(
            "current containers size {} doesn't match desired {}",
            current_containers.len(),
            desired_containers.len()
        ));
    }

    let (Some(desired_container), Some(current_container)) =
        (desired_containers.first(), current_containers.first())
    else {
        return None;
    };

    if desired_container.image != current_container.image {
        return Some(format!(
            "current container image {:?} doesn't match desired {:?}",
            current_container.image, desired_container.image
        ));
    }

    if desired_container.image_pull_policy != current_container.image_pull_policy {
        return Some(format!(
            "current container imagePullPolicy {:?} doesn't match desired {:?}",
            current_container.image_pull_policy, desired_container.image_pull_policy
        ));
    }

    if !slices_match(
        desired_container.command.as_deref(),
        current_container.command.as_deref(),
    ) {
        return Some(format!(
            "current container command {:?} doesn't match desired {:?}",
            current_container.command, desired_container.command
        ));
    }

    if !slices_match(
        desired_container.args.as_deref(),
        current_container.args.as_deref(),
    ) {
        return Some(format!(
            "current container args {:?} doesn't match desired {:?}",
            current_container.args, desired_container.args
        ));
    }

    None
}

/// The selector is the only recreate trigger; it is immutable on many
/// orchestrators, so an in-place update cannot fix the divergence.
fn service_needs_recreate(desired: &Service, current: &Service) -> Option<String> {
    let desired_selector = desired.spec.as_ref().and_then(|s| s.selector.as_ref());
    let current_selector = current.spec.as_ref().and_then(|s| s.selector.as_ref());
    if desired_selector != current_selector {
        return Some(format!(
            "current selector {:?} doesn't match desired {:?}",
            current_selector, desired_selector
        ));
    }
    None
}

fn service_ports(service: &Service) -> &[k8s_openapi::api::core::v1::ServicePort] {
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_deref())
        .unwrap_or(&[])
}

fn target_port_int(port: &k8s_openapi::api::core::v1::ServicePort) -> i32 {
    match port.target_port {
        Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(value)) => value,
        _ => 0,
    }
}

/// Port-tuple divergence is fixed with an in-place update.
fn service_needs_update(desired: &Service, current: &Service) -> Option<String> {
    let desired_ports = service_ports(desired);
    let current_ports = service_ports(current);
    if desired_ports.len() != current_ports.len() {
        return Some(format!(
            "current number of ports {} doesn't match desired {}",
            current_ports.len(),
            desired_ports.len()
        ));
    }

    let (Some(desired_port), Some(current_port)) = (desired_ports.first(), current_ports.first())
    else {
        return None;
    };

    if desired_port.name != current_port.name {
        return Some(format!(
            "current port name {:?} doesn't match desired {:?}",
            current_port.name, desired_port.name
        ));
    }

    if desired_port.protocol != current_port.protocol {
        return Some(format!(
            "current port protocol {:?} doesn't match desired {:?}",
            current_port.protocol, desired_port.protocol
        ));
    }

    if desired_port.port != current_port.port {
        return Some(format!(
            "current port number {} doesn't match desired {}",
            current_port.port, desired_port.port
        ));
    }

    if target_port_int(desired_port) != target_port_int(current_port) {
        return Some(format!(
            "current port target number {} doesn't match desired {}",
            target_port_int(current_port),
            target_port_int(desired_port)
        ));
    }

    None
}

async fn get_deployment(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Deployment>, Error> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(deployment) => Ok(Some(deployment)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn get_service(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Service>, Error> {
    let api: Api<Service> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(service) => Ok(Some(service)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Invalid user input is surfaced without a requeue; everything else is
/// retried after five seconds.
fn on_error(instance: Arc<App>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} {:?}", error, instance).red()
    );
    match error {
        Error::UserInput(_) => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(5)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EnvVar, ServicePort, ServiceSpec};
    use manor_types::AppSpec;

    fn test_app() -> App {
        let mut app = App::new("web", AppSpec::default());
        app.metadata.namespace = Some("ns".to_string());
        app.metadata.uid = Some("uid-1234".to_string());
        app
    }

    fn deployment_pair() -> (Deployment, Deployment) {
        let desired = actions::deployment_resource(&test_app(), "r.local").unwrap();
        (desired.clone(), desired)
    }

    fn service_pair() -> (Service, Service) {
        let desired = actions::service_resource(&test_app()).unwrap();
        (desired.clone(), desired)
    }

    #[test]
    fn svc_registry_requires_three_labels() {
        assert_eq!(
            svc_registry_parts("reg.infra.svc").unwrap(),
            Some(("reg".to_string(), "infra".to_string()))
        );
        assert_eq!(svc_registry_parts("r.local:5000").unwrap(), None);
        assert!(matches!(
            svc_registry_parts("infra.svc"),
            Err(Error::UserInput(_))
        ));
        assert!(matches!(
            svc_registry_parts("a.b.infra.svc"),
            Err(Error::UserInput(_))
        ));
    }

    #[test]
    fn node_port_rewrite_uses_first_nonzero_port() {
        let service = Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![
                    ServicePort {
                        port: 5000,
                        node_port: None,
                        ..Default::default()
                    },
                    ServicePort {
                        port: 5001,
                        node_port: Some(31500),
                        ..Default::default()
                    },
                    ServicePort {
                        port: 5002,
                        node_port: Some(31600),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(node_port_registry(&service), "127.0.0.1:31500");
        assert_eq!(node_port_registry(&Service::default()), "127.0.0.1:0");
    }

    #[test]
    fn converged_deployment_needs_no_update() {
        let (desired, current) = deployment_pair();
        assert_eq!(deployment_needs_update(&desired, &current), None);
    }

    #[test]
    fn replica_drift_triggers_update() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().replicas = Some(5);
        assert!(deployment_needs_update(&desired, &current).is_some());
    }

    #[test]
    fn image_drift_triggers_update() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
            Some("other.registry/ns/web".to_string());
        assert!(deployment_needs_update(&desired, &current).is_some());
    }

    #[test]
    fn pull_policy_drift_triggers_update() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0]
            .image_pull_policy = Some("Always".to_string());
        assert!(deployment_needs_update(&desired, &current).is_some());
    }

    #[test]
    fn command_and_args_drift_trigger_update() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].command =
            Some(vec!["/bin/other".to_string()]);
        assert!(deployment_needs_update(&desired, &current).is_some());

        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].args =
            Some(vec!["--other".to_string()]);
        assert!(deployment_needs_update(&desired, &current).is_some());
    }

    #[test]
    fn absent_and_empty_command_compare_equal() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].command =
            Some(vec![]);
        assert_eq!(deployment_needs_update(&desired, &current), None);
    }

    #[test]
    fn env_var_drift_is_not_a_trigger() {
        let (desired, mut current) = deployment_pair();
        current.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0]
            .env
            .get_or_insert_with(Vec::new)
            .push(EnvVar {
                name: "EXTRA".to_string(),
                value: Some("1".to_string()),
                ..Default::default()
            });
        assert_eq!(deployment_needs_update(&desired, &current), None);
    }

    #[test]
    fn selector_drift_triggers_recreate() {
        let (desired, mut current) = service_pair();
        assert_eq!(service_needs_recreate(&desired, &current), None);

        let mut selector = std::collections::BTreeMap::new();
        selector.insert("foo".to_string(), "bar".to_string());
        current.spec.as_mut().unwrap().selector = Some(selector);
        assert!(service_needs_recreate(&desired, &current).is_some());
    }

    #[test]
    fn port_tuple_drift_triggers_update() {
        let (desired, current) = service_pair();
        assert_eq!(service_needs_update(&desired, &current), None);

        let (desired, mut current) = service_pair();
        current.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].port = 9090;
        assert!(service_needs_update(&desired, &current).is_some());

        let (desired, mut current) = service_pair();
        current.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].target_port = Some(
            k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(9090),
        );
        assert!(service_needs_update(&desired, &current).is_some());

        let (desired, mut current) = service_pair();
        current.spec.as_mut().unwrap().ports.as_mut().unwrap()[0].name =
            Some("grpc".to_string());
        assert!(service_needs_update(&desired, &current).is_some());
    }
}
