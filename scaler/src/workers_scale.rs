use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use kube::Client;
use serde_json::Value;
use tracing::{info, instrument};

use crate::{
    config::{Opts, ScaleConfig},
    indexer::{ElasticIndexer, Indexer, LocalIndexer},
    inspector::KubeClusterApi,
    scenario::{
        is_managed, rosa::RosaCli, AutoscalerStrategy, DirectStrategy, ManagedStrategy,
        Orchestrator, ScaleOutcome, ScaleRequest, ScaleStrategy, StrategyKind,
    },
    utils::Context,
    watcher::KubeNodeWatcher,
};

/// Add worker nodes to the cluster of the current kube context and index how
/// long each of them took to become ready.
#[instrument(skip_all, fields(additional = opts.additional_worker_nodes))]
pub async fn run(opts: Opts) -> Result<ScaleOutcome> {
    let client = Client::try_default().await?;
    let cx = Arc::new(Context::new(
        KubeClusterApi::new(client.clone()),
        ScaleConfig::from(&opts),
    )?);

    let managed = is_managed(&cx.cluster, opts.cluster_type).await?;
    let kind = StrategyKind::select(managed, opts.enable_autoscaler);
    info!(?kind, managed, "strategy selected");
    let strategy: Box<dyn ScaleStrategy> = match kind {
        StrategyKind::Direct => Box::new(DirectStrategy::new(cx.clone())),
        StrategyKind::Autoscaler => Box::new(AutoscalerStrategy::new(cx.clone())),
        StrategyKind::Managed => {
            let cluster_id = opts
                .mc_cluster_id
                .clone()
                .ok_or_else(|| anyhow!("--mc-cluster-id is required on managed clusters"))?;
            Box::new(ManagedStrategy::new(
                cx.clone(),
                RosaCli::default(),
                cluster_id,
                opts.machine_pool.clone(),
            ))
        }
    };

    let indexer: Arc<dyn Indexer> = match &opts.es_server {
        Some(server) => Arc::new(ElasticIndexer::new(server, &opts.es_index)),
        None => Arc::new(LocalIndexer::new(&opts.metrics_directory)),
    };
    let metadata = match &opts.user_metadata {
        Some(path) => load_metadata(path).await?,
        None => BTreeMap::new(),
    };
    let scale_event_epoch = if opts.scale_event_epoch > 0 {
        Some(
            DateTime::<Utc>::from_timestamp(opts.scale_event_epoch, 0)
                .ok_or_else(|| anyhow!("invalid scale event epoch {}", opts.scale_event_epoch))?,
        )
    } else {
        None
    };

    let request = ScaleRequest {
        uuid: opts
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        job_name: opts.job_name.clone(),
        additional_workers: opts.additional_worker_nodes,
        metadata,
        indexer,
        restore: opts.gc,
        scale_event_epoch,
        autoscale: opts.enable_autoscaler,
    };
    info!(?request, "starting workers scale");

    let mut orchestrator =
        Orchestrator::new(cx, strategy, Box::new(KubeNodeWatcher::new(client)));
    let outcome = orchestrator.orchestrate_workload(&request).await?;
    info!(
        records = outcome.records,
        converged = outcome.converged,
        "workers scale finished"
    );
    Ok(outcome)
}

async fn load_metadata(path: &Path) -> Result<BTreeMap<String, Value>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| anyhow!("failed to read {}: {err}", path.display()))?;
    parse_metadata(&content)
}

/// Labels of a YAML mapping, an empty document yields no labels.
pub fn parse_metadata(content: &str) -> Result<BTreeMap<String, Value>> {
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_yaml::from_str(content)?)
}
