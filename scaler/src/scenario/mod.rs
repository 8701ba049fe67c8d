//! Strategies adding worker capacity and the orchestration of a measured run.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nodescale_common::latency::{
    QuantileSummary, LATENCY_METRIC_NAME, QUANTILES_METRIC_NAME,
};
use rand::RngCore;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::{
    config::ClusterType,
    correlator::{correlate, summarize, Reference, RunLabels},
    driver::ScaleDriver,
    indexer::Indexer,
    inspector::{created_before, new_machines, ClusterApi, MachineRecord},
    planner::GroupMutationPlan,
    utils::{Clock, Context},
    watcher::NodeWatcher,
    Error,
};

pub mod autoscaler;
pub mod direct;
pub mod job;
pub mod managed;
pub mod rosa;

pub use self::{autoscaler::AutoscalerStrategy, direct::DirectStrategy, managed::ManagedStrategy};

/// Request to add worker capacity and measure it.
#[derive(Clone)]
pub struct ScaleRequest {
    /// Correlation id of the run.
    pub uuid: String,
    /// Job name reported in every document.
    pub job_name: String,
    /// Number of workers to add.
    pub additional_workers: u32,
    /// Caller supplied labels.
    pub metadata: BTreeMap<String, Value>,
    /// Sink of the documents.
    pub indexer: Arc<dyn Indexer>,
    /// Restore the previous state once measured.
    pub restore: bool,
    /// Instant of a scale event triggered outside of this run.
    pub scale_event_epoch: Option<DateTime<Utc>>,
    /// Drive the change through an autoscaler.
    pub autoscale: bool,
}

impl fmt::Debug for ScaleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScaleRequest")
            .field("uuid", &self.uuid)
            .field("job_name", &self.job_name)
            .field("additional_workers", &self.additional_workers)
            .field("metadata", &self.metadata)
            .field("restore", &self.restore)
            .field("scale_event_epoch", &self.scale_event_epoch)
            .field("autoscale", &self.autoscale)
            .finish()
    }
}

impl ScaleRequest {
    fn labels(&self) -> RunLabels {
        RunLabels {
            uuid: self.uuid.clone(),
            job_name: self.job_name.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Bounds of a managed node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolBounds {
    /// Fixed replica count.
    Fixed(i32),
    /// Autoscaling between min and max replicas.
    Autoscaling {
        /// Lower bound.
        min: i32,
        /// Upper bound.
        max: i32,
    },
}

impl PoolBounds {
    /// Replicas the pool runs with when idle.
    pub fn baseline(&self) -> i32 {
        match self {
            PoolBounds::Fixed(replicas) => *replicas,
            PoolBounds::Autoscaling { min, .. } => *min,
        }
    }
}

/// A resource a strategy created or changed, undone during cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Injected {
    /// Per group autoscalers plus the cluster autoscaler.
    Autoscalers(Vec<String>),
    /// Job saturating the workers.
    SaturationJob {
        /// Namespace of the job.
        namespace: String,
        /// Name of the job.
        name: String,
    },
    /// Managed pool whose bounds were edited.
    ManagedPool {
        /// Bounds before the run.
        previous: PoolBounds,
    },
}

/// What a strategy did to the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleEvent {
    /// Groups touched, anchors per group reference times.
    pub plan: GroupMutationPlan,
    /// Instant latencies are measured against.
    pub reference: Reference,
    /// Whether the cluster fully converged before measuring.
    pub converged: bool,
    /// Resources to undo during cleanup.
    pub injected: Vec<Injected>,
}

impl ScaleEvent {
    /// Event of a run that changed nothing.
    pub fn unchanged(reference: DateTime<Utc>) -> Self {
        Self {
            plan: GroupMutationPlan::default(),
            reference: Reference::Uniform(reference),
            converged: true,
            injected: Vec::new(),
        }
    }
}

/// A way of adding worker capacity to a cluster.
#[async_trait]
pub trait ScaleStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Checks run before anything is read or mutated, failures abort the run.
    async fn preflight(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Add the requested capacity and wait for it to become schedulable,
    /// reporting the phases it goes through to `progress`.
    ///
    /// Resources created before a failure are removed before returning it.
    async fn scale(
        &self,
        request: &ScaleRequest,
        progress: &Progress,
    ) -> Result<ScaleEvent, Error>;

    /// Remove injected resources and, when asked, restore the previous
    /// capacity. Failures are logged.
    async fn cleanup(&self, event: &ScaleEvent, restore: bool);
}

/// Kind of strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Replica counts edited directly.
    Direct,
    /// Cluster autoscaler pushed by a saturation job.
    Autoscaler,
    /// Managed pool edited through the managed control plane CLI.
    Managed,
}

impl StrategyKind {
    /// Pick the strategy for the cluster.
    pub fn select(managed: bool, autoscale: bool) -> Self {
        match (managed, autoscale) {
            (true, _) => StrategyKind::Managed,
            (false, true) => StrategyKind::Autoscaler,
            (false, false) => StrategyKind::Direct,
        }
    }
}

/// Resolve whether the cluster is managed, inspecting it only for [`ClusterType::Auto`].
pub async fn is_managed(cluster: &impl ClusterApi, cluster_type: ClusterType) -> Result<bool, Error> {
    match cluster_type {
        ClusterType::Auto => cluster.is_managed_cluster().await,
        ClusterType::SelfManaged => Ok(false),
        ClusterType::Managed => Ok(true),
    }
}

/// Progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing happened yet.
    Idle,
    /// Groups and targets are decided, nothing changed yet.
    PlanComputed,
    /// Replica changes or autoscaling resources are being issued.
    Mutating,
    /// Waiting for the cluster to reach the new capacity.
    Converging,
    /// New machines are correlated and indexed.
    Measuring,
    /// Injected resources are removed and the previous state restored.
    Restoring,
    /// Run finished.
    Done,
}

/// Phase of a run shared between the orchestrator and its strategy.
#[derive(Debug, Clone)]
pub struct Progress(Arc<Mutex<Phase>>);

impl Default for Progress {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(Phase::Idle)))
    }
}

impl Progress {
    /// Current phase.
    pub fn phase(&self) -> Phase {
        *self.0.lock().expect("should be able to acquire lock")
    }

    /// Move to `phase`, entering the current phase again is a no-op.
    pub fn enter(&self, phase: Phase) {
        let mut current = self.0.lock().expect("should be able to acquire lock");
        if *current != phase {
            info!(from = ?*current, to = ?phase, "phase");
            *current = phase;
        }
    }
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleOutcome {
    /// Plan applied by the strategy.
    pub plan: GroupMutationPlan,
    /// Number of latency records indexed.
    pub records: usize,
    /// Quantile summaries indexed.
    pub summaries: Vec<QuantileSummary>,
    /// Whether the cluster fully converged.
    pub converged: bool,
}

/// Runs a strategy between two machine snapshots and measures the difference.
pub struct Orchestrator<A, R, C> {
    cx: Arc<Context<A, R, C>>,
    strategy: Box<dyn ScaleStrategy>,
    watcher: Box<dyn NodeWatcher>,
    progress: Progress,
}

impl<A, R, C> Orchestrator<A, R, C>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    /// Create an orchestrator for the strategy.
    pub fn new(
        cx: Arc<Context<A, R, C>>,
        strategy: Box<dyn ScaleStrategy>,
        watcher: Box<dyn NodeWatcher>,
    ) -> Self {
        Self {
            cx,
            strategy,
            watcher,
            progress: Progress::default(),
        }
    }

    /// Current progress.
    pub fn phase(&self) -> Phase {
        self.progress.phase()
    }

    /// Add the requested workers, measure how long each new machine took to
    /// become a ready node and index the results.
    ///
    /// With a scale event epoch the cluster is not changed, machines created
    /// after the epoch are measured against it.
    #[instrument(skip_all, fields(strategy = self.strategy.name(), uuid = %request.uuid))]
    pub async fn orchestrate_workload(
        &mut self,
        request: &ScaleRequest,
    ) -> Result<ScaleOutcome, Error> {
        let scaled = match request.scale_event_epoch {
            Some(epoch) => self.observe(epoch).await,
            None => self.scale(request).await,
        };
        let (before, event) = match scaled {
            Ok(scaled) => scaled,
            Err(err) => {
                self.progress.enter(Phase::Done);
                return Err(err);
            }
        };

        self.progress.enter(Phase::Measuring);
        let measured = self.measure(request, &before, &event).await;

        if request.scale_event_epoch.is_none() {
            self.progress.enter(Phase::Restoring);
            self.strategy.cleanup(&event, request.restore).await;
        }
        self.progress.enter(Phase::Done);
        measured
    }

    async fn scale(
        &mut self,
        request: &ScaleRequest,
    ) -> Result<(Vec<MachineRecord>, ScaleEvent), Error> {
        self.strategy.preflight().await?;
        let before = self.cx.cluster.list_machines().await?;
        self.watcher.start().await?;
        match self.strategy.scale(request, &self.progress).await {
            Ok(event) => Ok((before, event)),
            Err(err) => {
                if let Err(stop_err) = self.watcher.stop().await {
                    warn!(%stop_err, "failed to stop node watcher");
                }
                Err(err)
            }
        }
    }

    async fn observe(
        &mut self,
        epoch: DateTime<Utc>,
    ) -> Result<(Vec<MachineRecord>, ScaleEvent), Error> {
        info!(%epoch, "measuring a scale event triggered outside of this run");
        self.watcher.start().await?;
        self.progress.enter(Phase::Converging);
        let nodes_ready = ScaleDriver::new(self.cx.clone())
            .wait_for_nodes_ready()
            .await?;
        let machines = self.cx.cluster.list_machines().await?;
        let mut event = ScaleEvent::unchanged(epoch);
        event.converged = nodes_ready;
        Ok((created_before(&machines, epoch), event))
    }

    async fn measure(
        &mut self,
        request: &ScaleRequest,
        before: &[MachineRecord],
        event: &ScaleEvent,
    ) -> Result<ScaleOutcome, Error> {
        let signals = self.watcher.stop().await?;
        let after = self.cx.cluster.list_machines().await?;
        let machines = new_machines(before, after);
        let labels = request.labels();
        let records = correlate(&event.plan, event.reference, &machines, &signals, &labels);
        let summaries = summarize(&records, &labels, self.cx.clock.now());
        info!(
            machines = machines.len(),
            records = records.len(),
            "correlated new machines"
        );

        let documents = records
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        request
            .indexer
            .index(LATENCY_METRIC_NAME, documents)
            .await
            .map_err(|source| Error::Indexing { source })?;
        let documents = summaries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        request
            .indexer
            .index(QUANTILES_METRIC_NAME, documents)
            .await
            .map_err(|source| Error::Indexing { source })?;

        Ok(ScaleOutcome {
            plan: event.plan.clone(),
            records: records.len(),
            summaries,
            converged: event.converged,
        })
    }
}
