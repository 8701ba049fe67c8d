use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::ListParams,
    runtime::{watcher, WatchStreamExt},
    Api, Client,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::Error;

/// Creation and readiness of a node, keyed by node UID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeReadinessSignal {
    /// Creation time of the node object.
    pub created: DateTime<Utc>,
    /// Time the Ready condition became true.
    pub ready: DateTime<Utc>,
}

/// Records node readiness between `start` and `stop`.
#[async_trait]
pub trait NodeWatcher: Send {
    /// Begin observing nodes, called before the cluster is mutated.
    async fn start(&mut self) -> Result<(), Error>;
    /// Stop observing and report the signals keyed by node UID.
    async fn stop(&mut self) -> Result<HashMap<String, NodeReadinessSignal>, Error>;
}

/// Signal of a node whose Ready condition is true.
pub fn readiness_signal(node: &Node) -> Option<(String, NodeReadinessSignal)> {
    let uid = node.metadata.uid.clone()?;
    let created = node.metadata.creation_timestamp.as_ref()?.0;
    let ready = node
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "Ready" && c.status == "True")?
        .last_transition_time
        .as_ref()?
        .0;
    Some((uid, NodeReadinessSignal { created, ready }))
}

type Signals = Arc<Mutex<HashMap<String, NodeReadinessSignal>>>;

fn record(signals: &Signals, node: &Node) {
    if let Some((uid, signal)) = readiness_signal(node) {
        signals
            .lock()
            .expect("should be able to acquire lock")
            .entry(uid)
            .or_insert(signal);
    }
}

/// Watches nodes through the kube api.
pub struct KubeNodeWatcher {
    client: Client,
    signals: Signals,
    task: Option<JoinHandle<()>>,
}

impl KubeNodeWatcher {
    /// Create a watcher, nothing is observed until started.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            signals: Arc::default(),
            task: None,
        }
    }
}

#[async_trait]
impl NodeWatcher for KubeNodeWatcher {
    async fn start(&mut self) -> Result<(), Error> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let signals = self.signals.clone();
        self.task = Some(tokio::spawn(async move {
            let mut stream = watcher(nodes, watcher::Config::default())
                .default_backoff()
                .applied_objects()
                .boxed();
            loop {
                match stream.try_next().await {
                    Ok(Some(node)) => record(&signals, &node),
                    Ok(None) => break,
                    Err(err) => warn!(%err, "node watch failed, retrying"),
                }
            }
        }));
        debug!("node watcher started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<HashMap<String, NodeReadinessSignal>, Error> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Pick up nodes that turned ready after the last watch event.
        let nodes: Api<Node> = Api::all(self.client.clone());
        for node in nodes.list(&ListParams::default()).await?.items {
            record(&self.signals, &node);
        }
        let signals = std::mem::take(
            &mut *self
                .signals
                .lock()
                .expect("should be able to acquire lock"),
        );
        debug!(nodes = signals.len(), "node watcher stopped");
        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::utils::test::{mock_client, timeout_after_1s, ApiServerVerifier};

    fn node(uid: &str, ready: &str) -> serde_json::Value {
        json!({
            "metadata": {"name": uid, "uid": uid, "creationTimestamp": "2024-01-01T00:00:03Z"},
            "status": {"conditions": [{
                "type": "Ready",
                "status": ready,
                "lastTransitionTime": "2024-01-01T00:00:04Z"
            }]}
        })
    }

    #[test]
    fn signal_of_ready_node() {
        let node: Node = serde_json::from_value(node("u1", "True")).unwrap();
        assert_eq!(
            readiness_signal(&node),
            Some((
                "u1".to_owned(),
                NodeReadinessSignal {
                    created: "2024-01-01T00:00:03Z".parse().unwrap(),
                    ready: "2024-01-01T00:00:04Z".parse().unwrap(),
                }
            ))
        );
    }

    #[test]
    fn no_signal_until_ready() {
        let node: Node = serde_json::from_value(node("u1", "False")).unwrap();
        assert_eq!(readiness_signal(&node), None);
    }

    #[tokio::test]
    async fn stop_collects_listed_nodes() {
        let (client, handle) = mock_client();
        let mut server = ApiServerVerifier::new(handle);
        let mocksrv = tokio::spawn(async move {
            server
                .handle(
                    "GET",
                    "/api/v1/nodes",
                    200,
                    json!({
                        "apiVersion": "v1",
                        "kind": "NodeList",
                        "metadata": {},
                        "items": [node("u1", "True"), node("u2", "False")]
                    }),
                )
                .await;
        });
        let mut watcher = KubeNodeWatcher::new(client);
        let signals = watcher.stop().await.unwrap();
        timeout_after_1s(mocksrv).await;
        assert_eq!(signals.len(), 1);
        assert!(signals.contains_key("u1"));
    }
}
