use crate::util::Error;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    Api, Client,
    api::{ObjectMeta, Resource},
};
use manor_types::{App, PullPolicy};

/// Port every App container serves on.
const APP_PORT: i32 = 8080;

fn instance_name(instance: &App) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("App is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &App) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("App is missing metadata.namespace".to_string()))
}

fn owner_ref(instance: &App) -> Result<OwnerReference, Error> {
    instance
        .controller_owner_ref(&())
        .ok_or_else(|| Error::UserInput("App is missing metadata.name or uid".to_string()))
}

/// The Deployment materializing the App, with the image resolved against
/// the effective registry.
pub fn deployment_resource(instance: &App, image_registry: &str) -> Result<Deployment, Error> {
    let name = instance_name(instance)?.to_string();
    let namespace = instance_namespace(instance)?.to_string();
    let labels = manor_common::labels::app(&name);

    let image_pull_policy = instance
        .spec
        .image_pull_policy
        .unwrap_or(PullPolicy::IfNotPresent);
    let replicas = instance.spec.replicas.unwrap_or(1);
    let command = instance
        .spec
        .entrypoint
        .as_ref()
        .map(|entrypoint| vec![entrypoint.clone()]);
    let args = (!instance.spec.args.is_empty()).then(|| instance.spec.args.clone());

    let container_port = ContainerPort {
        name: Some("http".to_string()),
        protocol: Some("TCP".to_string()),
        container_port: APP_PORT,
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref(instance)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(format!("{}/{}/{}", image_registry, namespace, name)),
                        image_pull_policy: Some(image_pull_policy.as_str().to_string()),
                        command,
                        args,
                        resources: instance.spec.resources.clone(),
                        ports: Some(vec![container_port]),
                        env: Some(vec![EnvVar {
                            name: "PORT".to_string(),
                            value: Some(format!("{}", APP_PORT)),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// The ClusterIP Service fronting the App's pods.
pub fn service_resource(instance: &App) -> Result<Service, Error> {
    let name = instance_name(instance)?.to_string();
    let namespace = instance_namespace(instance)?.to_string();
    let labels = manor_common::labels::app(&name);

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref(instance)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                protocol: Some("TCP".to_string()),
                port: APP_PORT,
                target_port: Some(IntOrString::Int(APP_PORT)),
                ..Default::default()
            }]),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    })
}

pub async fn create_deployment(
    client: Client,
    instance: &App,
    image_registry: &str,
) -> Result<(), Error> {
    let deployment = deployment_resource(instance, image_registry)?;
    println!(
        "Creating Deployment '{}' for App '{}'",
        instance_name(instance)?,
        instance_name(instance)?,
    );
    let deployments: Api<Deployment> = Api::namespaced(client, instance_namespace(instance)?);
    match deployments.create(&Default::default(), &deployment).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

pub async fn update_deployment(
    client: Client,
    instance: &App,
    image_registry: &str,
    reason: String,
) -> Result<(), Error> {
    let name = instance_name(instance)?;
    println!("Updating Deployment '{}' • reason: {}", name, reason);
    let mut desired = deployment_resource(instance, image_registry)?;
    let deployments: Api<Deployment> = Api::namespaced(client, instance_namespace(instance)?);
    // Replacement needs the live resourceVersion.
    let current = deployments.get(name).await?;
    desired.metadata.resource_version = current.metadata.resource_version;
    deployments
        .replace(name, &Default::default(), &desired)
        .await?;
    Ok(())
}

pub async fn create_service(client: Client, instance: &App) -> Result<(), Error> {
    let service = service_resource(instance)?;
    println!("Creating Service '{}' for App '{}'", instance_name(instance)?, instance_name(instance)?);
    let services: Api<Service> = Api::namespaced(client, instance_namespace(instance)?);
    match services.create(&Default::default(), &service).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

/// Deletes and recreates the Service, keeping the allocated ClusterIP when
/// the orchestrator allows it. If the create fails the next reconcile
/// re-observes the missing Service and creates it with a fresh IP.
pub async fn recreate_service(client: Client, instance: &App, reason: String) -> Result<(), Error> {
    let name = instance_name(instance)?;
    println!("Recreating Service '{}' • reason: {}", name, reason);
    let mut desired = service_resource(instance)?;
    let services: Api<Service> = Api::namespaced(client, instance_namespace(instance)?);

    let current = match services.get(name).await {
        Ok(service) => Some(service),
        Err(kube::Error::Api(ae)) if ae.code == 404 => None,
        Err(e) => return Err(Error::from(e)),
    };

    match services.delete(name, &Default::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(ae)) if ae.code == 404 => {}
        Err(e) => return Err(Error::from(e)),
    }

    if let (Some(desired_spec), Some(current_spec)) = (
        desired.spec.as_mut(),
        current.as_ref().and_then(|c| c.spec.as_ref()),
    ) {
        desired_spec.cluster_ip = current_spec.cluster_ip.clone();
    }

    services.create(&Default::default(), &desired).await?;
    Ok(())
}

pub async fn update_service(client: Client, instance: &App, reason: String) -> Result<(), Error> {
    let name = instance_name(instance)?;
    println!("Updating Service '{}' • reason: {}", name, reason);
    let mut desired = service_resource(instance)?;
    let services: Api<Service> = Api::namespaced(client, instance_namespace(instance)?);
    let current = services.get(name).await?;
    desired.metadata.resource_version = current.metadata.resource_version.clone();
    // An in-place update must not clear the allocated ClusterIP.
    if let (Some(desired_spec), Some(current_spec)) =
        (desired.spec.as_mut(), current.spec.as_ref())
    {
        desired_spec.cluster_ip = current_spec.cluster_ip.clone();
    }
    services
        .replace(name, &Default::default(), &desired)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ResourceRequirements;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use manor_types::AppSpec;
    use std::collections::BTreeMap;

    fn app(spec: AppSpec) -> App {
        let mut app = App::new("web", spec);
        app.metadata.namespace = Some("ns".to_string());
        app.metadata.uid = Some("uid-1234".to_string());
        app
    }

    #[test]
    fn fresh_app_deployment_shape() {
        let instance = app(AppSpec {
            replicas: Some(3),
            entrypoint: Some("/bin/app".to_string()),
            args: vec!["--serve".to_string()],
            ..Default::default()
        });
        let deployment = deployment_resource(&instance, "r.local").unwrap();

        assert_eq!(deployment.metadata.name.as_deref(), Some("web"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("ns"));
        let owners = deployment.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners[0].kind, "App");
        assert_eq!(owners[0].name, "web");

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector
                .match_labels
                .as_ref()
                .and_then(|l| l.get(manor_common::labels::APP))
                .map(String::as_str),
            Some("web")
        );

        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.name, "web");
        assert_eq!(container.image.as_deref(), Some("r.local/ns/web"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.command.as_deref(), Some(&["/bin/app".to_string()][..]));
        assert_eq!(container.args.as_deref(), Some(&["--serve".to_string()][..]));

        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].container_port, 8080);

        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "PORT");
        assert_eq!(env[0].value.as_deref(), Some("8080"));
    }

    #[test]
    fn deployment_defaults_apply() {
        let deployment = deployment_resource(&app(AppSpec::default()), "r.local").unwrap();
        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        let container = &spec.template.spec.as_ref().unwrap().containers[0];
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
        assert_eq!(container.command, None);
        assert_eq!(container.args, None);
    }

    #[test]
    fn declared_resources_reach_the_container() {
        let mut limits = BTreeMap::new();
        limits.insert("memory".to_string(), Quantity("256Mi".to_string()));
        let instance = app(AppSpec {
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        });
        let deployment = deployment_resource(&instance, "r.local").unwrap();
        let container = &deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0];
        assert_eq!(
            container
                .resources
                .as_ref()
                .and_then(|r| r.limits.as_ref())
                .and_then(|l| l.get("memory")),
            Some(&Quantity("256Mi".to_string()))
        );
    }

    #[test]
    fn cluster_ip_service_shape() {
        let service = service_resource(&app(AppSpec::default())).unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("web"));
        let spec = service.spec.as_ref().unwrap();
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(
            spec.selector
                .as_ref()
                .and_then(|l| l.get(manor_common::labels::APP))
                .map(String::as_str),
            Some("web")
        );
        let port = &spec.ports.as_ref().unwrap()[0];
        assert_eq!(port.name.as_deref(), Some("http"));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        assert_eq!(port.port, 8080);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));
    }
}
