use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{batch::v1::JobSpec, core::v1::Node};
use kube::{
    api::{
        ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    },
    Api, Client, ResourceExt,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::{
    inspector::{
        resources::{
            is_red_hat_managed, machine_image_id, machine_ready_time, ClusterAutoscaler,
            ClusterAutoscalerSpec, Machine, MachineAutoscaler, MachineAutoscalerSpec, MachineSet,
            ResourceLimits, ScaleDown, ScaleTargetRef, CLUSTER_AUTOSCALER_NAME,
            INFRASTRUCTURE_NAME, MACHINE_API_NAMESPACE,
        },
        ClusterApi, GroupAutoscaler, MachineRecord, NodeState, ProvisioningGroup,
    },
    labels::{managed_labels, MACHINE_ROLE_LABEL, WORKER_MACHINE_SELECTOR, WORKER_NODE_LABEL},
    utils::{self, apply_namespace, is_not_found},
    Error, CONTROLLER_NAME,
};

/// Cluster access through the OpenShift machine API.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    /// Create a new cluster api on top of a kube client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machine_sets(&self) -> Api<MachineSet> {
        Api::namespaced(self.client.clone(), MACHINE_API_NAMESPACE)
    }

    fn machine_autoscalers(&self) -> Api<MachineAutoscaler> {
        Api::namespaced(self.client.clone(), MACHINE_API_NAMESPACE)
    }

    fn cluster_autoscalers(&self) -> Api<ClusterAutoscaler> {
        Api::all(self.client.clone())
    }
}

fn is_worker_set(set: &MachineSet) -> bool {
    let role = set
        .spec
        .template
        .as_ref()
        .and_then(|t| t.metadata.as_ref())
        .and_then(|m| m.labels.as_ref())
        .and_then(|labels| labels.get(MACHINE_ROLE_LABEL));
    role.map_or(true, |role| role == "worker")
}

fn provisioning_group(set: MachineSet) -> ProvisioningGroup {
    let name = set.name_any();
    let status = set.status.unwrap_or_default();
    ProvisioningGroup {
        name,
        desired_replicas: set.spec.replicas.unwrap_or_default(),
        replicas: status.replicas,
        ready_replicas: status.ready_replicas.unwrap_or_default(),
    }
}

fn machine_record(machine: Machine) -> Option<MachineRecord> {
    let name = machine.metadata.name?;
    let Some(created) = machine.metadata.creation_timestamp else {
        warn!(%name, "machine without creation timestamp");
        return None;
    };
    let status = machine.status.unwrap_or_default();
    Some(MachineRecord {
        node_uid: status.node_ref.and_then(|node| node.uid),
        created: created.0,
        ready: status.provider_status.as_ref().and_then(machine_ready_time),
        image_id: machine
            .spec
            .provider_spec
            .and_then(|spec| spec.value)
            .as_ref()
            .and_then(machine_image_id),
        name,
    })
}

fn node_state(node: Node) -> Option<NodeState> {
    let uid = node.metadata.uid?;
    let name = node.metadata.name.unwrap_or_default();
    let worker = node
        .metadata
        .labels
        .as_ref()
        .map_or(false, |labels| labels.contains_key(WORKER_NODE_LABEL));
    let ready = node
        .status
        .and_then(|status| status.conditions)
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    Some(NodeState {
        name,
        uid,
        worker,
        ready,
    })
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_groups(&self) -> Result<Vec<ProvisioningGroup>, Error> {
        let sets = self.machine_sets().list(&ListParams::default()).await?;
        Ok(sets
            .items
            .into_iter()
            .filter(is_worker_set)
            .map(provisioning_group)
            .collect())
    }

    async fn get_group(&self, name: &str) -> Result<ProvisioningGroup, Error> {
        match self.machine_sets().get(name).await {
            Ok(set) => Ok(provisioning_group(set)),
            Err(err) if is_not_found(&err) => Err(Error::NotFound(format!("machineset {name}"))),
            Err(err) => Err(err.into()),
        }
    }

    async fn scale_group(&self, name: &str, replicas: i32) -> Result<(), Error> {
        let patch = json!({ "spec": { "replicas": replicas } });
        match self
            .machine_sets()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Err(Error::NotFound(format!("machineset {name}"))),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_machines(&self) -> Result<Vec<MachineRecord>, Error> {
        let machines: Api<Machine> = Api::namespaced(self.client.clone(), MACHINE_API_NAMESPACE);
        let machines = machines
            .list(&ListParams::default().labels(WORKER_MACHINE_SELECTOR))
            .await?;
        Ok(machines
            .items
            .into_iter()
            .filter_map(machine_record)
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeState>, Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let nodes = nodes.list(&ListParams::default()).await?;
        Ok(nodes.items.into_iter().filter_map(node_state).collect())
    }

    async fn is_managed_cluster(&self) -> Result<bool, Error> {
        let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "Infrastructure");
        let infrastructures: Api<DynamicObject> =
            Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk));
        match infrastructures.get(INFRASTRUCTURE_NAME).await {
            Ok(infrastructure) => Ok(is_red_hat_managed(&infrastructure.data)),
            Err(err) if is_not_found(&err) => {
                debug!("no infrastructure object, assuming a self managed cluster");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn apply_autoscalers(
        &self,
        autoscalers: &[GroupAutoscaler],
        max_nodes_total: i32,
    ) -> Result<(), Error> {
        let serverside = PatchParams::apply(CONTROLLER_NAME);
        let machine_autoscalers = self.machine_autoscalers();
        for autoscaler in autoscalers {
            let mut resource = MachineAutoscaler::new(
                &autoscaler.group,
                MachineAutoscalerSpec {
                    min_replicas: autoscaler.min_replicas,
                    max_replicas: autoscaler.max_replicas,
                    scale_target_ref: ScaleTargetRef::machine_set(&autoscaler.group),
                },
            );
            resource.metadata.labels = managed_labels();
            machine_autoscalers
                .patch(&autoscaler.group, &serverside, &Patch::Apply(resource))
                .await?;
            debug!(group = %autoscaler.group, "machine autoscaler applied");
        }

        let mut resource = ClusterAutoscaler::new(
            CLUSTER_AUTOSCALER_NAME,
            ClusterAutoscalerSpec {
                resource_limits: Some(ResourceLimits {
                    max_nodes_total: Some(max_nodes_total),
                }),
                scale_down: Some(ScaleDown { enabled: false }),
            },
        );
        resource.metadata.labels = managed_labels();
        self.cluster_autoscalers()
            .patch(CLUSTER_AUTOSCALER_NAME, &serverside, &Patch::Apply(resource))
            .await?;
        Ok(())
    }

    async fn delete_autoscalers(&self, groups: &[String]) -> Result<(), Error> {
        let machine_autoscalers = self.machine_autoscalers();
        for group in groups {
            match machine_autoscalers
                .delete(group, &DeleteParams::default())
                .await
            {
                Ok(_) => {}
                Err(err) if is_not_found(&err) => {}
                Err(err) => return Err(err.into()),
            }
        }
        match self
            .cluster_autoscalers()
            .delete(CLUSTER_AUTOSCALER_NAME, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_job(
        &self,
        ns: &str,
        name: &str,
        spec: JobSpec,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        apply_namespace(self.client.clone(), ns).await?;
        let labels = spec
            .template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone());
        Ok(utils::create_job(self.client.clone(), ns, name, spec, labels).await?)
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), Error> {
        Ok(utils::delete_job(self.client.clone(), ns, name).await?)
    }
}
