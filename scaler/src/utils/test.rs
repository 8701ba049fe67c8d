use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hyper::{body::to_bytes, Body};
use k8s_openapi::api::batch::v1::JobSpec;
use kube::Client;
use rand::rngs::mock::StepRng;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::{
    config::{SaturationConfig, ScaleConfig},
    indexer::Indexer,
    inspector::{ClusterApi, GroupAutoscaler, MachineRecord, NodeState, ProvisioningGroup},
    utils::{Clock, Context},
    watcher::{NodeReadinessSignal, NodeWatcher},
    Error,
};

/// Handle serving the requests of a [`mock_client`].
pub type ApiServerHandle = tower_test::mock::Handle<http::Request<Body>, http::Response<Body>>;

/// Kube client backed by a mock service.
pub fn mock_client() -> (Client, ApiServerHandle) {
    let (mock_service, handle) =
        tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
    (Client::new(mock_service, "default"), handle)
}

/// Wait for a mock api server task, failing after one second.
pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("stub succeeded")
}

/// Serves the requests a test expects, one at a time.
pub struct ApiServerVerifier(ApiServerHandle);

impl ApiServerVerifier {
    /// Serve the requests sent through `handle`.
    pub fn new(handle: ApiServerHandle) -> Self {
        Self(handle)
    }

    /// Assert the next request and answer it with the given status and body.
    pub async fn handle(&mut self, method: &str, path: &str, status: u16, body: Value) -> Request {
        let (request, send) = self.0.next_request().await.expect("service not called");
        let request = Request::from_request(request)
            .await
            .expect("request should be readable");
        assert_eq!(request.method, method);
        assert_eq!(request.path(), path);
        send.send_response(
            http::Response::builder()
                .status(status)
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        );
        request
    }

    /// Assert the next request and answer it with its own body.
    pub async fn echo(&mut self, method: &str, path: &str) -> Request {
        let (request, send) = self.0.next_request().await.expect("service not called");
        let request = Request::from_request(request)
            .await
            .expect("request should be readable");
        assert_eq!(request.method, method);
        assert_eq!(request.path(), path);
        send.send_response(
            http::Response::builder()
                .body(Body::from(request.body.0.clone()))
                .unwrap(),
        );
        request
    }
}

/// Status body returned by the api server for a missing resource.
pub fn not_found() -> Value {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": "not found",
        "reason": "NotFound",
        "code": 404
    })
}

/// Helper struct to assert the contents of a mock Request.
/// The only purpose of this struct is its debug implementation
/// to be used in expect![[]] calls.
pub struct Request {
    /// HTTP method.
    pub method: String,
    /// Path and query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Pretty printed JSON body.
    pub body: Raw,
}

// Explicit Debug implementation so the fields are not marked as dead code.
impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

impl Request {
    /// Read a request and its body.
    pub async fn from_request(request: http::Request<Body>) -> Result<Self> {
        let method = request.method().to_string();
        let uri = request.uri().to_string();
        let headers = request.headers().clone();
        let body_bytes = to_bytes(request.into_body()).await?;
        let body = if !body_bytes.is_empty() {
            let json: serde_json::Value =
                serde_json::from_slice(&body_bytes).expect("body should be JSON");
            Raw(serde_json::to_string_pretty(&json)?)
        } else {
            Raw("".to_string())
        };
        Ok(Self {
            method,
            uri,
            headers,
            body,
        })
    }

    /// Uri without its query.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or_default()
    }

    /// Body parsed as JSON.
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body.0).expect("body should be JSON")
    }
}

/// Raw String the does not escape its value for debugging.
pub struct Raw(pub String);

impl std::fmt::Debug for Raw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instant every test run starts at.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Clock frozen at [`base_time`].
pub struct MockClock;
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        base_time()
    }
}

impl ScaleConfig {
    /// Short timeouts and polls for tests.
    pub fn test() -> Self {
        Self {
            timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(1),
            autoscaler_warmup: Duration::from_millis(1),
            managed_settle: Duration::from_millis(1),
            max_replicas_per_group: None,
            saturation: SaturationConfig::default(),
        }
    }
}

// Add test specific implementation to the Context
impl<A> Context<A, StepRng, MockClock>
where
    A: ClusterApi,
{
    /// Create a test context with a fake cluster and a frozen clock.
    pub fn test(cluster: A) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            rng: Mutex::new(StepRng::new(29, 7)),
            clock: MockClock,
            config: ScaleConfig::test(),
        })
    }
}

/// In memory cluster where every poll moves each group one replica closer to
/// its desired count.
///
/// New machines are created 1s after [`base_time`], provisioned after 2s,
/// their node registers after 3s and is ready after 4.2s.
#[derive(Clone, Default)]
pub struct FakeCluster {
    /// Shared state, see [`FakeCluster::lock`].
    pub state: Arc<Mutex<FakeState>>,
}

/// State of a [`FakeCluster`].
#[derive(Default)]
pub struct FakeState {
    /// Machine sets by name.
    pub groups: BTreeMap<String, ProvisioningGroup>,
    /// Machines of every group.
    pub machines: Vec<MachineRecord>,
    /// Control plane and worker nodes.
    pub nodes: Vec<NodeState>,
    /// Readiness of every new node by UID.
    pub signals: HashMap<String, NodeReadinessSignal>,
    /// Reported as a managed cluster.
    pub managed: bool,
    /// Groups that never add machines.
    pub stuck: HashSet<String>,
    /// Groups whose replica changes are rejected.
    pub broken: HashSet<String>,
    /// New nodes never become ready.
    pub unready: bool,
    /// Listing nodes fails.
    pub fail_list_nodes: bool,
    /// Every replica change requested, rejected ones included.
    pub scale_calls: Vec<(String, i32)>,
    /// Applied group autoscalers.
    pub autoscalers: Vec<GroupAutoscaler>,
    /// Node limit of the cluster autoscaler.
    pub max_nodes_total: Option<i32>,
    /// Groups whose autoscalers were deleted.
    pub deleted_autoscalers: Vec<String>,
    /// Created jobs as namespace, name and spec.
    pub jobs: Vec<(String, String, JobSpec)>,
    /// Deleted jobs as namespace and name.
    pub deleted_jobs: Vec<(String, String)>,
    next_machine: usize,
}

impl FakeCluster {
    /// Cluster with one ready control plane node and the given groups, all at
    /// their desired replica count.
    pub fn new(groups: &[(&str, i32)]) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.lock();
            state.nodes.push(NodeState {
                name: "master-0".to_owned(),
                uid: "uid-master-0".to_owned(),
                worker: false,
                ready: true,
            });
            for (name, replicas) in groups {
                state.groups.insert(
                    name.to_string(),
                    ProvisioningGroup {
                        name: name.to_string(),
                        desired_replicas: *replicas,
                        replicas: 0,
                        ready_replicas: 0,
                    },
                );
                for _ in 0..*replicas {
                    state.add_machine(name, base_time() - chrono::Duration::days(1), false);
                }
            }
        }
        cluster
    }

    /// Lock the state.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("should be able to acquire lock")
    }

    /// Raise the desired count of a group as a controller outside the run would.
    pub fn grow(&self, group: &str, replicas: i32) {
        if let Some(g) = self.lock().groups.get_mut(group) {
            g.desired_replicas += replicas;
        }
    }

    /// Step every group until it reached its desired count.
    pub fn settle(&self) {
        let mut state = self.lock();
        let groups: Vec<String> = state.groups.keys().cloned().collect();
        for group in groups {
            while state.groups[&group].desired_replicas != state.groups[&group].replicas
                && !state.stuck.contains(&group)
            {
                state.step(&group);
            }
        }
    }

    /// Number of worker nodes.
    pub fn worker_count(&self) -> usize {
        self.lock().nodes.iter().filter(|n| n.worker).count()
    }

    /// Desired replicas of a group.
    pub fn desired(&self, group: &str) -> i32 {
        self.lock().groups[group].desired_replicas
    }
}

impl FakeState {
    fn add_machine(&mut self, group: &str, created: DateTime<Utc>, signal: bool) {
        self.next_machine += 1;
        let name = format!("{group}-{}", self.next_machine);
        let uid = format!("uid-{name}");
        let ready = !(signal && self.unready);
        self.machines.push(MachineRecord {
            name: name.clone(),
            node_uid: Some(uid.clone()),
            created,
            ready: Some(created + chrono::Duration::seconds(1)),
            image_id: Some("ami-test".to_owned()),
        });
        self.nodes.push(NodeState {
            name: name.clone(),
            uid: uid.clone(),
            worker: true,
            ready,
        });
        if signal && ready {
            self.signals.insert(
                uid,
                NodeReadinessSignal {
                    created: created + chrono::Duration::seconds(2),
                    ready: created + chrono::Duration::milliseconds(3200),
                },
            );
        }
        if let Some(g) = self.groups.get_mut(group) {
            g.replicas += 1;
            if ready {
                g.ready_replicas += 1;
            }
        }
    }

    fn remove_machine(&mut self, group: &str) {
        let Some(idx) = self
            .machines
            .iter()
            .rposition(|m| m.name.rsplit_once('-').map(|(g, _)| g) == Some(group))
        else {
            return;
        };
        let machine = self.machines.remove(idx);
        let ready = self
            .nodes
            .iter()
            .position(|n| Some(&n.uid) == machine.node_uid.as_ref())
            .map(|idx| self.nodes.remove(idx).ready)
            .unwrap_or(false);
        if let Some(g) = self.groups.get_mut(group) {
            g.replicas -= 1;
            if ready {
                g.ready_replicas -= 1;
            }
        }
    }

    fn step(&mut self, group: &str) {
        let Some(g) = self.groups.get(group) else {
            return;
        };
        if g.desired_replicas > g.replicas && !self.stuck.contains(group) {
            self.add_machine(group, base_time() + chrono::Duration::seconds(1), true);
        } else if g.desired_replicas < g.replicas {
            self.remove_machine(group);
        }
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_groups(&self) -> Result<Vec<ProvisioningGroup>, Error> {
        Ok(self.lock().groups.values().cloned().collect())
    }

    async fn get_group(&self, name: &str) -> Result<ProvisioningGroup, Error> {
        let mut state = self.lock();
        state.step(name);
        state
            .groups
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("group {name}")))
    }

    async fn scale_group(&self, name: &str, replicas: i32) -> Result<(), Error> {
        let mut state = self.lock();
        state.scale_calls.push((name.to_owned(), replicas));
        if state.broken.contains(name) {
            return Err(anyhow!("replica change of {name} rejected").into());
        }
        match state.groups.get_mut(name) {
            Some(group) => {
                group.desired_replicas = replicas;
                Ok(())
            }
            None => Err(Error::NotFound(format!("group {name}"))),
        }
    }

    async fn list_machines(&self) -> Result<Vec<MachineRecord>, Error> {
        Ok(self.lock().machines.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeState>, Error> {
        let mut state = self.lock();
        if state.fail_list_nodes {
            return Err(anyhow!("connection refused").into());
        }
        let groups: Vec<String> = state.groups.keys().cloned().collect();
        for group in groups {
            state.step(&group);
        }
        Ok(state.nodes.clone())
    }

    async fn is_managed_cluster(&self) -> Result<bool, Error> {
        Ok(self.lock().managed)
    }

    async fn apply_autoscalers(
        &self,
        autoscalers: &[GroupAutoscaler],
        max_nodes_total: i32,
    ) -> Result<(), Error> {
        let mut state = self.lock();
        state.autoscalers = autoscalers.to_vec();
        state.max_nodes_total = Some(max_nodes_total);
        Ok(())
    }

    async fn delete_autoscalers(&self, groups: &[String]) -> Result<(), Error> {
        let mut state = self.lock();
        state.deleted_autoscalers.extend(groups.iter().cloned());
        state.autoscalers.clear();
        state.max_nodes_total = None;
        Ok(())
    }

    async fn create_job(
        &self,
        ns: &str,
        name: &str,
        spec: JobSpec,
    ) -> Result<Option<DateTime<Utc>>, Error> {
        let mut state = self.lock();
        state.jobs.push((ns.to_owned(), name.to_owned(), spec));
        // Pending pods make the autoscaler raise every group to its bound.
        let bounds: Vec<(String, i32)> = state
            .autoscalers
            .iter()
            .map(|a| (a.group.clone(), a.max_replicas))
            .collect();
        for (group, max) in bounds {
            if let Some(g) = state.groups.get_mut(&group) {
                g.desired_replicas = max;
            }
        }
        Ok(Some(base_time()))
    }

    async fn delete_job(&self, ns: &str, name: &str) -> Result<(), Error> {
        self.lock()
            .deleted_jobs
            .push((ns.to_owned(), name.to_owned()));
        Ok(())
    }
}

/// Watcher reporting the signals recorded by a [`FakeCluster`].
pub struct FakeWatcher {
    /// Cluster the signals are read from.
    pub cluster: FakeCluster,
    /// Whether [`NodeWatcher::start`] was called.
    pub started: bool,
}

impl FakeWatcher {
    /// Watcher over the signals of `cluster`.
    pub fn new(cluster: FakeCluster) -> Self {
        Self {
            cluster,
            started: false,
        }
    }
}

#[async_trait]
impl NodeWatcher for FakeWatcher {
    async fn start(&mut self) -> Result<(), Error> {
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<HashMap<String, NodeReadinessSignal>, Error> {
        assert!(self.started, "watcher stopped before it was started");
        Ok(self.cluster.lock().signals.clone())
    }
}

/// Indexer keeping every document in memory.
#[derive(Clone, Default)]
pub struct CollectingIndexer {
    /// Documents by metric name.
    pub documents: Arc<Mutex<BTreeMap<String, Vec<Value>>>>,
}

impl CollectingIndexer {
    /// Documents indexed under `metric_name`.
    pub fn documents(&self, metric_name: &str) -> Vec<Value> {
        self.documents
            .lock()
            .expect("should be able to acquire lock")
            .get(metric_name)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Indexer for CollectingIndexer {
    async fn index(&self, metric_name: &str, documents: Vec<Value>) -> Result<()> {
        self.documents
            .lock()
            .expect("should be able to acquire lock")
            .entry(metric_name.to_owned())
            .or_default()
            .extend(documents);
        Ok(())
    }
}
