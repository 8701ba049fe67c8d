use std::sync::Arc;

use anyhow::anyhow;
use rand::RngCore;
use tokio::{
    task::JoinSet,
    time::{sleep, Instant},
};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::{
    inspector::{worker_count, ClusterApi, NodeState},
    planner::{GroupMutation, GroupMutationPlan},
    scenario::{Phase, Progress},
    utils::{Clock, Context},
    Error,
};

/// Result of applying a plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Convergence {
    /// The applied plan, with the mutation time of every group that was changed.
    pub plan: GroupMutationPlan,
    /// Groups whose replica change or poll failed.
    pub failed: Vec<String>,
    /// Groups that did not converge in time.
    pub timed_out: Vec<String>,
    /// Whether every node became ready in time.
    pub nodes_ready: bool,
}

impl Convergence {
    /// Report whether every group converged and every node is ready.
    pub fn complete(&self) -> bool {
        self.failed.is_empty() && self.timed_out.is_empty() && self.nodes_ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupOutcome {
    Converged,
    TimedOut,
    Failed,
}

/// Applies replica changes concurrently and waits for the cluster to catch up.
pub struct ScaleDriver<A, R, C> {
    cx: Arc<Context<A, R, C>>,
    progress: Option<Progress>,
}

impl<A, R, C> ScaleDriver<A, R, C>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    /// Create a driver sharing the run context.
    pub fn new(cx: Arc<Context<A, R, C>>) -> Self {
        Self { cx, progress: None }
    }

    /// Report the mutating and converging phases of [`ScaleDriver::apply`].
    pub fn reporting(mut self, progress: &Progress) -> Self {
        self.progress = Some(progress.clone());
        self
    }

    fn report(&self, phase: Phase) {
        if let Some(progress) = &self.progress {
            progress.enter(phase);
        }
    }

    /// Set every planned group to its target and wait until the groups
    /// converged and all nodes are ready.
    ///
    /// Replica changes are issued concurrently, then every changed group is
    /// polled concurrently. A group failing or timing out is reported without
    /// affecting the others. Only a failure to list nodes is returned as an
    /// error.
    #[instrument(skip_all, fields(groups = plan.len()))]
    pub async fn apply(&self, plan: GroupMutationPlan) -> Result<Convergence, Error> {
        if plan.is_empty() {
            debug!("empty plan, nothing to apply");
            return Ok(Convergence {
                plan,
                nodes_ready: true,
                ..Default::default()
            });
        }

        self.report(Phase::Mutating);
        let mut tasks = JoinSet::new();
        for (group, mut mutation) in plan {
            let cx = self.cx.clone();
            tasks.spawn(
                async move {
                    let issued = set_replicas(&cx, &group, &mut mutation).await;
                    (group, mutation, issued)
                }
                .in_current_span(),
            );
        }

        let mut convergence = Convergence::default();
        let mut issued = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (group, mutation, ok) =
                joined.map_err(|err| anyhow!("group task panicked: {err}"))?;
            if ok {
                issued.push((group.clone(), mutation.target_replicas));
            } else {
                convergence.failed.push(group.clone());
            }
            convergence.plan.insert(group, mutation);
        }

        self.report(Phase::Converging);
        let mut tasks = JoinSet::new();
        for (group, target) in issued {
            let cx = self.cx.clone();
            tasks.spawn(
                async move {
                    let outcome = wait_for_group(&cx, &group, target).await;
                    (group, outcome)
                }
                .in_current_span(),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            let (group, outcome) = joined.map_err(|err| anyhow!("group task panicked: {err}"))?;
            match outcome {
                GroupOutcome::Converged => {}
                GroupOutcome::TimedOut => convergence.timed_out.push(group),
                GroupOutcome::Failed => convergence.failed.push(group),
            }
        }
        convergence.failed.sort();
        convergence.timed_out.sort();

        convergence.nodes_ready = self.wait_for_nodes_ready().await?;
        Ok(convergence)
    }

    /// Bring every group of the plan back to its previous replica count.
    ///
    /// Failures are logged, never returned.
    #[instrument(skip_all, fields(groups = plan.len()))]
    pub async fn restore(&self, plan: &GroupMutationPlan) {
        if plan.is_empty() {
            return;
        }
        info!("restoring previous replica counts");
        let driver = ScaleDriver::new(self.cx.clone());
        match driver.apply(plan.reverted()).await {
            Ok(convergence) if convergence.complete() => info!("replica counts restored"),
            Ok(convergence) => warn!(
                failed = ?convergence.failed,
                timed_out = ?convergence.timed_out,
                nodes_ready = convergence.nodes_ready,
                "replica counts partially restored"
            ),
            Err(err) => error!(%err, "failed to restore replica counts"),
        }
    }

    /// Wait until every node reports Ready, false on timeout.
    pub async fn wait_for_nodes_ready(&self) -> Result<bool, Error> {
        self.poll_nodes("all nodes ready", |nodes| nodes.iter().all(|n| n.ready))
            .await
    }

    /// Wait until at least `count` worker nodes exist, false on timeout.
    pub async fn wait_for_worker_count(&self, count: usize) -> Result<bool, Error> {
        self.poll_nodes("worker count reached", |nodes| {
            worker_count(nodes) >= count
        })
        .await
    }

    async fn poll_nodes(
        &self,
        condition: &str,
        done: impl Fn(&[NodeState]) -> bool,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + self.cx.config.timeout;
        loop {
            let nodes = self.cx.cluster.list_nodes().await?;
            if done(&nodes) {
                info!(nodes = nodes.len(), "{condition}");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    nodes = nodes.len(),
                    ready = nodes.iter().filter(|n| n.ready).count(),
                    timeout = ?self.cx.config.timeout,
                    "timed out waiting for {condition}"
                );
                return Ok(false);
            }
            sleep(self.cx.config.poll_interval).await;
        }
    }
}

async fn set_replicas<A: ClusterApi, R, C: Clock>(
    cx: &Context<A, R, C>,
    group: &str,
    mutation: &mut GroupMutation,
) -> bool {
    let issued = cx.clock.now();
    if let Err(err) = cx.cluster.scale_group(group, mutation.target_replicas).await {
        error!(%group, %err, "failed to set replicas");
        return false;
    }
    mutation.last_mutation = Some(issued);
    info!(
        %group,
        from = mutation.previous_replicas,
        to = mutation.target_replicas,
        "replicas set"
    );
    true
}

async fn wait_for_group<A: ClusterApi, R, C>(
    cx: &Context<A, R, C>,
    group: &str,
    target: i32,
) -> GroupOutcome {
    let deadline = Instant::now() + cx.config.timeout;
    loop {
        match cx.cluster.get_group(group).await {
            Ok(state) if state.converged_at(target) => {
                info!(%group, replicas = target, "group converged");
                return GroupOutcome::Converged;
            }
            Ok(state) => debug!(
                %group,
                replicas = state.replicas,
                ready = state.ready_replicas,
                target,
                "waiting for group"
            ),
            Err(err) => {
                error!(%group, %err, "failed to read group");
                return GroupOutcome::Failed;
            }
        }
        if Instant::now() >= deadline {
            warn!(%group, target, timeout = ?cx.config.timeout, "group did not converge");
            return GroupOutcome::TimedOut;
        }
        sleep(cx.config.poll_interval).await;
    }
}
