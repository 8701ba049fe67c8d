//! Typed views of the OpenShift machine and autoscaling resources.
//!
//! Only the fields read or written by a scale run are modelled, everything
//! else is left to the server.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Namespace holding machine sets, machines and machine autoscalers.
pub const MACHINE_API_NAMESPACE: &str = "openshift-machine-api";

/// The cluster autoscaler is a singleton with this name.
pub const CLUSTER_AUTOSCALER_NAME: &str = "default";

/// Name of the cluster wide Infrastructure object.
pub const INFRASTRUCTURE_NAME: &str = "cluster";

/// Group of machines sharing a template.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "MachineSet",
    namespaced,
    status = "MachineSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetSpec {
    /// Desired number of machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Template of the machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<MachineTemplate>,
}

/// Template of the machines of a set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Metadata stamped on the machines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,
}

/// Labels stamped on the machines of a set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Machine labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

/// Observed replica counts of a set.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineSetStatus {
    /// Machines created.
    #[serde(default)]
    pub replicas: i32,
    /// Machines whose node is ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
    /// Machines whose node is available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_replicas: Option<i32>,
}

/// A single cloud instance managed by the machine API.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider specific configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_spec: Option<ProviderSpec>,
}

/// Opaque provider configuration.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
pub struct ProviderSpec {
    /// Raw provider payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Observed state of a machine.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Node backed by the machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<ObjectReference>,
    /// Opaque provider status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<Value>,
    /// Lifecycle phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Bounds the autoscaler applies to a machine set.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaling.openshift.io",
    version = "v1beta1",
    kind = "MachineAutoscaler",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineAutoscalerSpec {
    /// Lower replica bound.
    pub min_replicas: i32,
    /// Upper replica bound.
    pub max_replicas: i32,
    /// Machine set the bounds apply to.
    pub scale_target_ref: ScaleTargetRef,
}

/// Reference to a scalable resource.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleTargetRef {
    /// Api version of the target.
    pub api_version: String,
    /// Kind of the target.
    pub kind: String,
    /// Name of the target.
    pub name: String,
}

impl ScaleTargetRef {
    /// Reference a machine set by name.
    pub fn machine_set(name: &str) -> Self {
        Self {
            api_version: "machine.openshift.io/v1beta1".to_owned(),
            kind: "MachineSet".to_owned(),
            name: name.to_owned(),
        }
    }
}

/// Cluster wide autoscaler settings.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "autoscaling.openshift.io",
    version = "v1",
    kind = "ClusterAutoscaler"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAutoscalerSpec {
    /// Cluster size bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimits>,
    /// Scale down behaviour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down: Option<ScaleDown>,
}

/// Cluster size bounds.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Total node count the autoscaler never exceeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes_total: Option<i32>,
}

/// Scale down behaviour.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDown {
    /// Whether idle nodes are removed.
    pub enabled: bool,
}

const PROVISIONED_CONDITIONS: [&str; 2] = ["MachineCreation", "MachineCreated"];

/// Time the provider reported the instance as created.
///
/// Read from the `lastTransitionTime` of a true `MachineCreation` or
/// `MachineCreated` condition of the provider status.
pub fn machine_ready_time(provider_status: &Value) -> Option<DateTime<Utc>> {
    provider_status
        .get("conditions")?
        .as_array()?
        .iter()
        .filter(|condition| {
            condition
                .get("type")
                .and_then(Value::as_str)
                .map_or(false, |t| PROVISIONED_CONDITIONS.contains(&t))
                && condition.get("status").and_then(Value::as_str) == Some("True")
        })
        .find_map(|condition| {
            let time = condition.get("lastTransitionTime")?.as_str()?;
            DateTime::parse_from_rfc3339(time)
                .ok()
                .map(|time| time.with_timezone(&Utc))
        })
}

/// Image the instance boots from, for AWS, Azure and GCP provider specs.
pub fn machine_image_id(provider_spec: &Value) -> Option<String> {
    ["/ami/id", "/image/resourceID", "/disks/0/image"]
        .iter()
        .find_map(|pointer| provider_spec.pointer(pointer)?.as_str())
        .map(str::to_owned)
}

/// Report whether an Infrastructure object carries the `red-hat-managed` tag.
pub fn is_red_hat_managed(infrastructure: &Value) -> bool {
    infrastructure
        .pointer("/status/platformStatus/aws/resourceTags")
        .and_then(Value::as_array)
        .map_or(false, |tags| {
            tags.iter().any(|tag| {
                tag.get("key").and_then(Value::as_str) == Some("red-hat-managed")
                    && tag.get("value").and_then(Value::as_str) == Some("true")
            })
        })
}
