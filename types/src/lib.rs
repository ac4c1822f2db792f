use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a condition, mirroring the core ConditionStatus values.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Image pull policy for an App container.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PullPolicy {
    Always,
    Never,
    IfNotPresent,
}

impl PullPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullPolicy::Always => "Always",
            PullPolicy::Never => "Never",
            PullPolicy::IfNotPresent => "IfNotPresent",
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "manor.codelogia.com",
    version = "v1",
    kind = "App",
    plural = "apps",
    derive = "PartialEq",
    status = "AppStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct AppSpec {
    /// The image registry to override the default image registry.
    pub image_registry: Option<String>,
    /// Image pull policy. One of Always, Never, IfNotPresent.
    /// Defaults to IfNotPresent.
    pub image_pull_policy: Option<PullPolicy>,
    /// The number of replicas for the App. Defaults to 1.
    pub replicas: Option<i32>,
    /// Compute resources required by the App.
    pub resources: Option<ResourceRequirements>,
    /// The entrypoint command for the App.
    pub entrypoint: Option<String>,
    /// The arguments for the entrypoint command of the App.
    #[serde(default)]
    pub args: Vec<String>,
}

/// App condition types.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AppConditionType {
    /// All replicas have been initialized but are not running yet.
    Initialized,
    /// The App is able to handle requests.
    Ready,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AppCondition {
    #[serde(rename = "type")]
    pub type_: AppConditionType,
    pub status: ConditionStatus,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppStatus {
    #[serde(default)]
    pub conditions: Vec<AppCondition>,
    pub last_updated: Option<Time>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "manor.codelogia.com",
    version = "v1",
    kind = "Artifact",
    plural = "artifacts",
    derive = "PartialEq",
    status = "ArtifactStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = "{\"jsonPath\": \".spec.app\", \"name\": \"APP\", \"type\": \"string\" }")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactSpec {
    /// The name of the App the artifact is tied to.
    #[serde(default)]
    pub app: String,
    /// The image registry to override the default image registry.
    pub image_registry: Option<String>,
}

/// Artifact condition types. An Artifact's conditions form a trajectory:
/// once a type is recorded True it is never removed or flipped.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ArtifactConditionType {
    /// The Artifact was observed and its status initialized.
    Initialized,
    /// The build pod is ready and the build may be fed source.
    #[serde(rename = "In progress")]
    InProgress,
    /// The build pod reached a terminal phase.
    Completed,
}

impl fmt::Display for ArtifactConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactConditionType::Initialized => write!(f, "Initialized"),
            ArtifactConditionType::InProgress => write!(f, "In progress"),
            ArtifactConditionType::Completed => write!(f, "Completed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ArtifactCondition {
    #[serde(rename = "type")]
    pub type_: ArtifactConditionType,
    pub status: ConditionStatus,
}

impl ArtifactCondition {
    pub fn new_true(type_: ArtifactConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactStatus {
    #[serde(default)]
    pub conditions: Vec<ArtifactCondition>,
    pub last_updated: Option<Time>,
}

impl ArtifactStatus {
    /// Whether the given condition type has been recorded with status True.
    pub fn has_condition(&self, type_: ArtifactConditionType) -> bool {
        self.conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
    }
}

impl Artifact {
    pub fn has_condition(&self, type_: ArtifactConditionType) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.has_condition(type_))
    }
}
