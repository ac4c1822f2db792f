use crate::args::Args;
use crate::util::{Error, patch::*};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, Pod, PodSpec, Probe,
    Secret, SecretKeySelector, SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{
    Api, Client,
    api::{ObjectMeta, Resource},
};
use manor_types::*;
use rand::RngCore;
use std::collections::BTreeMap;

/// Port the build server listens on inside the build pod.
const BUILD_POD_PORT: i32 = 8081;

/// Scratch directory the build runs in, backed by the pod's emptyDir.
const BUILD_DIR: &str = "/tmp/build";

/// Name of the credentials secret owned by an Artifact.
pub fn secret_name(app: &str) -> String {
    format!("{}-app-builder-creds", app)
}

/// Name of the build pod owned by an Artifact.
pub fn pod_name(app: &str) -> String {
    format!("{}-app-builder", app)
}

fn instance_name(instance: &Artifact) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Artifact is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &Artifact) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Artifact is missing metadata.namespace".to_string()))
}

fn owner_ref(instance: &Artifact) -> Result<OwnerReference, Error> {
    instance
        .controller_owner_ref(&())
        .ok_or_else(|| Error::UserInput("Artifact is missing metadata.name or uid".to_string()))
}

/// Records the Initialized condition on a freshly observed Artifact.
pub async fn initialize(client: Client, instance: &Artifact) -> Result<(), Error> {
    append_condition(client, instance, ArtifactConditionType::Initialized).await
}

/// Records the In progress condition once the build pod is Ready.
pub async fn mark_in_progress(client: Client, instance: &Artifact) -> Result<(), Error> {
    append_condition(client, instance, ArtifactConditionType::InProgress).await
}

/// Records the Completed condition once the build pod reached a terminal phase.
pub async fn complete(client: Client, instance: &Artifact) -> Result<(), Error> {
    append_condition(client, instance, ArtifactConditionType::Completed).await
}

/// Appends a True condition to the Artifact's trajectory. Conditions are
/// never removed or flipped, so a type already present is left untouched.
async fn append_condition(
    client: Client,
    instance: &Artifact,
    type_: ArtifactConditionType,
) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        if !status.has_condition(type_) {
            status.conditions.push(ArtifactCondition::new_true(type_));
        }
    })
    .await?;
    Ok(())
}

/// A fresh 32-byte build token, hex-encoded.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn secret_resource(instance: &Artifact) -> Result<Secret, Error> {
    let namespace = instance_namespace(instance)?.to_string();
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(secret_name(&instance.spec.app)),
            namespace: Some(namespace),
            labels: Some(manor_common::labels::app(&instance.spec.app)),
            owner_references: Some(vec![owner_ref(instance)?]),
            ..Default::default()
        },
        string_data: Some({
            let mut data = BTreeMap::new();
            data.insert("token".to_string(), generate_token());
            data
        }),
        ..Default::default()
    })
}

pub async fn create_secret(client: Client, instance: &Artifact) -> Result<(), Error> {
    let secret = secret_resource(instance)?;
    println!(
        "Creating Secret '{}' with build credentials for Artifact '{}'",
        secret_name(&instance.spec.app),
        instance_name(instance)?,
    );
    let secrets: Api<Secret> = Api::namespaced(client, instance_namespace(instance)?);
    match secrets.create(&Default::default(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

pub fn pod_resource(instance: &Artifact, args: &Args) -> Result<Pod, Error> {
    let app = instance.spec.app.clone();
    let namespace = instance_namespace(instance)?.to_string();
    let image_registry = instance
        .spec
        .image_registry
        .clone()
        .unwrap_or_else(|| args.default_image_registry.clone());
    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(&app)),
            namespace: Some(namespace.clone()),
            labels: Some(manor_common::labels::app(&app)),
            owner_references: Some(vec![owner_ref(instance)?]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            // Never restart: the build server admits exactly one build per
            // process, and the pod is the build unit.
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "app-builder".to_string(),
                image: Some(args.app_builder_image.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                security_context: Some(SecurityContext {
                    run_as_user: Some(1000),
                    run_as_non_root: Some(true),
                    allow_privilege_escalation: Some(false),
                    read_only_root_filesystem: Some(true),
                    ..Default::default()
                }),
                ports: Some(vec![ContainerPort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    container_port: BUILD_POD_PORT,
                    ..Default::default()
                }]),
                env: Some(vec![
                    env_var("DOCKER_HOST", &args.docker_host),
                    env_var("ADDR", &format!(":{}", BUILD_POD_PORT)),
                    env_var("BUILD_DIR", BUILD_DIR),
                    EnvVar {
                        name: "TOKEN".to_string(),
                        value_from: Some(EnvVarSource {
                            secret_key_ref: Some(SecretKeySelector {
                                name: secret_name(&app),
                                key: "token".to_string(),
                                optional: None,
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    env_var("APP_NAMESPACE", &namespace),
                    env_var("APP_NAME", &app),
                    env_var("IMAGE_REGISTRY", &image_registry),
                ]),
                readiness_probe: Some(tcp_probe(3, 3)),
                liveness_probe: Some(tcp_probe(15, 10)),
                // Scratch space consistent with the read-only root filesystem.
                volume_mounts: Some(vec![VolumeMount {
                    name: "tmp".to_string(),
                    read_only: Some(false),
                    mount_path: "/tmp".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "tmp".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    })
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn tcp_probe(initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(BUILD_POD_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        ..Default::default()
    }
}

pub async fn create_pod(client: Client, instance: &Artifact, args: &Args) -> Result<(), Error> {
    let pod = pod_resource(instance, args)?;
    println!(
        "Creating Pod '{}' for building Artifact '{}'",
        pod_name(&instance.spec.app),
        instance_name(instance)?,
    );
    let pods: Api<Pod> = Api::namespaced(client, instance_namespace(instance)?);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_args() -> Args {
        Args {
            docker_host: "tcp://docker:2375".to_string(),
            default_image_registry: "r.local".to_string(),
            app_builder_image: "codelogia/app-builder:latest".to_string(),
        }
    }

    fn test_artifact(registry: Option<&str>) -> Artifact {
        let mut artifact = Artifact::new(
            "b1",
            ArtifactSpec {
                app: "web".to_string(),
                image_registry: registry.map(str::to_string),
            },
        );
        artifact.metadata.namespace = Some("ns".to_string());
        artifact.metadata.uid = Some("uid-1234".to_string());
        artifact
    }

    #[test]
    fn token_is_32_random_bytes_hex_encoded() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[test]
    fn secret_is_named_labeled_and_owned() {
        let secret = secret_resource(&test_artifact(None)).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("web-app-builder-creds"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(
            secret
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(manor_common::labels::APP))
                .map(String::as_str),
            Some("web")
        );
        let owners = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Artifact");
        assert_eq!(owners[0].name, "b1");
        assert_eq!(
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get("token"))
                .map(String::len),
            Some(64)
        );
    }

    #[test]
    fn build_pod_is_single_shot_and_sandboxed() {
        let pod = pod_resource(&test_artifact(None), &test_args()).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("web-app-builder"));
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);

        let container = &spec.containers[0];
        assert_eq!(container.name, "app-builder");
        assert_eq!(container.image.as_deref(), Some("codelogia/app-builder:latest"));
        assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));

        let security = container.security_context.as_ref().unwrap();
        assert_eq!(security.run_as_user, Some(1000));
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.allow_privilege_escalation, Some(false));
        assert_eq!(security.read_only_root_filesystem, Some(true));

        let ports = container.ports.as_ref().unwrap();
        assert_eq!(ports[0].name.as_deref(), Some("http"));
        assert_eq!(ports[0].container_port, 8081);

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts[0].mount_path, "/tmp");
        let volumes = spec.volumes.as_ref().unwrap();
        assert!(volumes[0].empty_dir.is_some());

        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(3));
        assert_eq!(readiness.period_seconds, Some(3));
        let liveness = container.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.initial_delay_seconds, Some(15));
        assert_eq!(liveness.period_seconds, Some(10));
    }

    #[test]
    fn build_pod_env_follows_the_contract_order() {
        let pod = pod_resource(&test_artifact(None), &test_args()).unwrap();
        let env = pod.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "DOCKER_HOST",
                "ADDR",
                "BUILD_DIR",
                "TOKEN",
                "APP_NAMESPACE",
                "APP_NAME",
                "IMAGE_REGISTRY"
            ]
        );
        assert_eq!(env[1].value.as_deref(), Some(":8081"));
        assert_eq!(env[2].value.as_deref(), Some("/tmp/build"));
        let token_ref = env[3]
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(token_ref.name, "web-app-builder-creds");
        assert_eq!(token_ref.key, "token");
        assert_eq!(env[4].value.as_deref(), Some("ns"));
        assert_eq!(env[5].value.as_deref(), Some("web"));
        assert_eq!(env[6].value.as_deref(), Some("r.local"));
    }

    #[test]
    fn artifact_registry_override_wins_over_default() {
        let pod = pod_resource(&test_artifact(Some("edge.registry:5000")), &test_args()).unwrap();
        let env = pod.spec.as_ref().unwrap().containers[0].env.as_ref().unwrap();
        let registry = env.iter().find(|e| e.name == "IMAGE_REGISTRY").unwrap();
        assert_eq!(registry.value.as_deref(), Some("edge.registry:5000"));
    }
}
