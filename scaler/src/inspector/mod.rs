//! Reads provisioning groups, machines and nodes, and applies the few
//! mutations a scale run needs.
use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::JobSpec;

use crate::Error;

mod openshift;
pub mod resources;

pub use self::openshift::KubeClusterApi;

/// A horizontally scalable set of machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningGroup {
    /// Group name.
    pub name: String,
    /// Requested replica count.
    pub desired_replicas: i32,
    /// Machines that exist.
    pub replicas: i32,
    /// Machines whose node is ready.
    pub ready_replicas: i32,
}

impl ProvisioningGroup {
    /// Report whether both the created and ready replica counts reached the target.
    pub fn converged_at(&self, target: i32) -> bool {
        self.replicas == target && self.ready_replicas == target
    }
}

/// A worker machine as listed at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineRecord {
    /// Machine name, `<group>-<suffix>`.
    pub name: String,
    /// UID of the node registered by the machine.
    pub node_uid: Option<String>,
    /// Creation time of the machine object.
    pub created: DateTime<Utc>,
    /// Time the provider reported the instance as created.
    pub ready: Option<DateTime<Utc>>,
    /// Boot image, when the provider reports one.
    pub image_id: Option<String>,
}

/// Readiness of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    /// Node name.
    pub name: String,
    /// Node UID.
    pub uid: String,
    /// Whether the node carries the worker role.
    pub worker: bool,
    /// Whether the Ready condition is true.
    pub ready: bool,
}

/// Autoscaler bounds of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAutoscaler {
    /// Group the bounds apply to.
    pub group: String,
    /// Lower bound.
    pub min_replicas: i32,
    /// Upper bound.
    pub max_replicas: i32,
}

/// Access to the cluster state a scale run reads and mutates.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List the worker provisioning groups.
    async fn list_groups(&self) -> Result<Vec<ProvisioningGroup>, Error>;
    /// Read a single group.
    async fn get_group(&self, name: &str) -> Result<ProvisioningGroup, Error>;
    /// Set the replica count of a group.
    async fn scale_group(&self, name: &str, replicas: i32) -> Result<(), Error>;
    /// List the worker machines.
    async fn list_machines(&self) -> Result<Vec<MachineRecord>, Error>;
    /// List every node.
    async fn list_nodes(&self) -> Result<Vec<NodeState>, Error>;
    /// Report whether the cluster is operated by a managed service.
    async fn is_managed_cluster(&self) -> Result<bool, Error>;
    /// Create or update the per group autoscalers and the cluster autoscaler.
    async fn apply_autoscalers(
        &self,
        autoscalers: &[GroupAutoscaler],
        max_nodes_total: i32,
    ) -> Result<(), Error>;
    /// Remove the per group autoscalers and the cluster autoscaler.
    async fn delete_autoscalers(&self, groups: &[String]) -> Result<(), Error>;
    /// Create a job, returning its creation time when known.
    async fn create_job(
        &self,
        ns: &str,
        name: &str,
        spec: JobSpec,
    ) -> Result<Option<DateTime<Utc>>, Error>;
    /// Delete a job and its pods.
    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), Error>;
}

/// Group names keyed by their desired replica count, names sorted.
pub fn replicas_snapshot(groups: &[ProvisioningGroup]) -> BTreeMap<i32, Vec<String>> {
    let mut snapshot: BTreeMap<i32, Vec<String>> = BTreeMap::new();
    for group in groups {
        snapshot
            .entry(group.desired_replicas)
            .or_default()
            .push(group.name.clone());
    }
    for names in snapshot.values_mut() {
        names.sort();
    }
    snapshot
}

/// Machines of `after` that are not part of `before`.
pub fn new_machines(before: &[MachineRecord], after: Vec<MachineRecord>) -> Vec<MachineRecord> {
    let known: HashSet<&str> = before.iter().map(|m| m.name.as_str()).collect();
    after
        .into_iter()
        .filter(|m| !known.contains(m.name.as_str()))
        .collect()
}

/// Machines created strictly before the epoch.
pub fn created_before(machines: &[MachineRecord], epoch: DateTime<Utc>) -> Vec<MachineRecord> {
    machines
        .iter()
        .filter(|m| m.created < epoch)
        .cloned()
        .collect()
}

/// Number of worker nodes.
pub fn worker_count(nodes: &[NodeState]) -> usize {
    nodes.iter().filter(|n| n.worker).count()
}
