use std::collections::BTreeMap;

/// Label set on nodes that run workloads.
pub const WORKER_NODE_LABEL: &str = "node-role.kubernetes.io/worker";

/// Selects machines with the worker role.
pub const WORKER_MACHINE_SELECTOR: &str = "machine.openshift.io/cluster-api-machine-role=worker";

/// Label carrying the role of machines created from a MachineSet template.
pub const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Labels that indicate the resource was created by a scale run.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "managed-by".to_owned(),
        "nodescale".to_owned(),
    )]))
}

/// Managed labels plus the given extra labels.
pub fn managed_labels_extend(
    extend_labels: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut labels = managed_labels().unwrap_or_default();
    labels.extend(extend_labels.unwrap_or_default());
    Some(labels)
}

/// Create labels that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "app".to_owned(),
        app.to_owned(),
    )]))
}
