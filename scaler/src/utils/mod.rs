//! Utils is shared functions and constants for a scale run
use std::{collections::BTreeMap, sync::Mutex};

/// Fakes and mocks shared by the tests.
#[cfg(test)]
pub mod test;

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::{
    batch::v1::{Job, JobSpec},
    core::v1::Namespace,
};
use kube::{
    api::{DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy},
    client::Client,
    core::ObjectMeta,
    Api,
};
use rand::{distributions::Alphanumeric, rngs::StdRng, thread_rng, Rng, RngCore, SeedableRng};

use crate::{
    config::ScaleConfig,
    inspector::ClusterApi,
    labels::{managed_labels, managed_labels_extend},
    CONTROLLER_NAME,
};

/// Scale run context
pub struct Context<A, R, C> {
    /// Cluster access
    pub cluster: A,
    /// Random number generator
    pub rng: Mutex<R>,
    /// Clock that provide the current time
    pub clock: C,
    /// Timing and sizing knobs
    pub config: ScaleConfig,
}

impl<A> Context<A, StdRng, UtcClock> {
    /// Create new context
    pub fn new(cluster: A, config: ScaleConfig) -> Result<Self>
    where
        A: ClusterApi,
    {
        Ok(Context {
            cluster,
            rng: Mutex::new(StdRng::from_rng(thread_rng())?),
            clock: UtcClock,
            config,
        })
    }
}

impl<A, R: RngCore, C> Context<A, R, C> {
    /// Random lowercase alphanumeric suffix for generated names.
    pub fn random_suffix(&self, len: usize) -> String {
        let mut rng = self.rng.lock().expect("should be able to acquire lock");
        (&mut *rng)
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect()
    }
}

/// Provides the current time.
pub trait Clock: Send + Sync {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Report whether a kube error means the resource does not exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "NotFound" || resp.code == 404)
}

/// Report whether a kube error means the resource already exists.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "AlreadyExists" || resp.code == 409)
}

/// Apply a namespace
pub async fn apply_namespace(client: Client, ns: &str) -> Result<Namespace, kube::error::Error> {
    let serverside = PatchParams::apply(CONTROLLER_NAME);
    let namespaces: Api<Namespace> = Api::all(client);

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(ns.to_owned()),
            labels: managed_labels(),
            ..ObjectMeta::default()
        },
        ..Default::default()
    };
    namespaces
        .patch(ns, &serverside, &Patch::Apply(namespace))
        .await
}

/// Create a job, a job that already exists is left untouched.
pub async fn create_job(
    client: Client,
    ns: &str,
    name: &str,
    spec: JobSpec,
    labels: Option<BTreeMap<String, String>>,
) -> Result<Option<DateTime<Utc>>, kube::error::Error> {
    let jobs: Api<Job> = Api::namespaced(client, ns);

    let job = Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            labels: managed_labels_extend(labels),
            ..ObjectMeta::default()
        },
        spec: Some(spec),
        ..Default::default()
    };
    match jobs.create(&PostParams::default(), &job).await {
        Ok(job) => Ok(job.metadata.creation_timestamp.map(|time| time.0)),
        Err(err) if is_already_exists(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Delete a job and its pods
pub async fn delete_job(client: Client, ns: &str, name: &str) -> Result<(), kube::error::Error> {
    let jobs: Api<Job> = Api::namespaced(client, ns);
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    };

    match jobs.delete(name, &params).await {
        Ok(_) => Ok(()),
        Err(err) if is_not_found(&err) => Ok(()),
        Err(e) => Err(e),
    }
}
