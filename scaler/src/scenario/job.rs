use std::{collections::BTreeMap, time::Duration};

use k8s_openapi::{
    api::{
        batch::v1::JobSpec,
        core::v1::{
            Affinity, Container, PodAffinityTerm, PodAntiAffinity, PodSpec, PodTemplateSpec,
            ResourceRequirements,
        },
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::LabelSelector},
};
use kube::api::ObjectMeta;

use crate::{
    config::SaturationConfig,
    labels::{selector_labels, WORKER_NODE_LABEL},
};

/// App label of the saturation pods.
pub const SATURATION_APP: &str = "nodescale-saturation";

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Job running one sleeping pod per worker, at most one per node.
///
/// Pods that cannot be placed stay pending, which is what makes the cluster
/// autoscaler add machines.
pub fn saturation_job_spec(config: &SaturationConfig, pods: i32, duration: Duration) -> JobSpec {
    let labels = selector_labels(SATURATION_APP);
    JobSpec {
        parallelism: Some(pods),
        completions: Some(pods),
        backoff_limit: Some(0),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: labels.clone(),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                affinity: Some(Affinity {
                    pod_anti_affinity: Some(PodAntiAffinity {
                        required_during_scheduling_ignored_during_execution: Some(vec![
                            PodAffinityTerm {
                                label_selector: Some(LabelSelector {
                                    match_labels: labels,
                                    ..Default::default()
                                }),
                                topology_key: HOSTNAME_TOPOLOGY_KEY.to_owned(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                node_selector: Some(BTreeMap::from_iter(vec![(
                    WORKER_NODE_LABEL.to_owned(),
                    String::new(),
                )])),
                containers: vec![Container {
                    name: "sleep".to_owned(),
                    image: Some(config.image.clone()),
                    command: Some(vec![
                        "sleep".to_owned(),
                        duration.as_secs().max(1).to_string(),
                    ]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from_iter(vec![(
                            "cpu".to_owned(),
                            Quantity(config.cpu_request.clone()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                restart_policy: Some("Never".to_owned()),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn one_pod_per_worker() {
        let spec = saturation_job_spec(&SaturationConfig::default(), 5, Duration::from_secs(600));
        assert_eq!(spec.parallelism, Some(5));
        assert_eq!(spec.completions, Some(5));
        assert_eq!(spec.backoff_limit, Some(0));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod.node_selector.unwrap().get(WORKER_NODE_LABEL),
            Some(&String::new())
        );
        let terms = pod
            .affinity
            .unwrap()
            .pod_anti_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        let term = &terms[0];
        assert_eq!(term.topology_key, "kubernetes.io/hostname");
        assert_eq!(
            term.label_selector.as_ref().unwrap().match_labels,
            spec.template.metadata.unwrap().labels
        );

        let container = &pod.containers[0];
        expect![[r#"
            Some(
                [
                    "sleep",
                    "600",
                ],
            )
        "#]]
        .assert_debug_eq(&container.command);
        assert_eq!(
            container.image.as_deref(),
            Some("registry.access.redhat.com/ubi9/ubi-minimal:latest")
        );
        let requests = container.resources.as_ref().unwrap().requests.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("100m".to_owned()));
    }

    #[test]
    fn sleeps_at_least_a_second() {
        let spec = saturation_job_spec(&SaturationConfig::default(), 1, Duration::from_millis(300));
        let pod = spec.template.spec.unwrap();
        assert_eq!(
            pod.containers[0].command,
            Some(vec!["sleep".to_owned(), "1".to_owned()])
        );
    }
}
