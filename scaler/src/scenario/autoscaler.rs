use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    correlator::Reference,
    driver::ScaleDriver,
    inspector::{replicas_snapshot, worker_count, ClusterApi, GroupAutoscaler},
    planner::{plan_allocation, GroupMutationPlan},
    scenario::{
        job::saturation_job_spec, Injected, Phase, Progress, ScaleEvent, ScaleRequest,
        ScaleStrategy,
    },
    utils::{Clock, Context},
    Error,
};

/// Lets the cluster autoscaler add the workers.
///
/// Every planned group gets an autoscaler bounded by its target, then a job
/// with one pod per wanted worker and anti-affinity between its pods leaves
/// pods pending until the new machines joined.
pub struct AutoscalerStrategy<A, R, C> {
    cx: Arc<Context<A, R, C>>,
}

impl<A, R, C> AutoscalerStrategy<A, R, C>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    /// Create the strategy.
    pub fn new(cx: Arc<Context<A, R, C>>) -> Self {
        Self { cx }
    }

    async fn inject_and_wait(
        &self,
        plan: &GroupMutationPlan,
        workers: usize,
        injected: &mut Vec<Injected>,
        progress: &Progress,
    ) -> Result<(DateTime<Utc>, bool), Error> {
        progress.enter(Phase::Mutating);
        let autoscalers: Vec<GroupAutoscaler> = plan
            .iter()
            .map(|(group, mutation)| GroupAutoscaler {
                group: group.clone(),
                min_replicas: mutation.previous_replicas.min(1),
                max_replicas: mutation.target_replicas,
            })
            .collect();
        let max_nodes_total = self.cx.cluster.list_nodes().await?.len() as i32
            + plan.increments() as i32;
        self.cx
            .cluster
            .apply_autoscalers(&autoscalers, max_nodes_total)
            .await?;
        injected.push(Injected::Autoscalers(
            autoscalers.into_iter().map(|a| a.group).collect(),
        ));
        info!(max_nodes_total, "autoscalers applied");

        let target = workers + plan.increments() as usize;
        let saturation = &self.cx.config.saturation;
        let name = format!("nodescale-saturation-{}", self.cx.random_suffix(5));
        let spec = saturation_job_spec(saturation, target as i32, self.cx.config.timeout);
        let created = self
            .cx
            .cluster
            .create_job(&saturation.namespace, &name, spec)
            .await?;
        injected.push(Injected::SaturationJob {
            namespace: saturation.namespace.clone(),
            name: name.clone(),
        });
        let triggered = created.unwrap_or_else(|| self.cx.clock.now());
        info!(job = %name, pods = target, %triggered, "saturation job created");

        progress.enter(Phase::Converging);
        sleep(self.cx.config.autoscaler_warmup).await;
        let driver = ScaleDriver::new(self.cx.clone());
        let workers_joined = driver.wait_for_worker_count(target).await?;
        let nodes_ready = driver.wait_for_nodes_ready().await?;
        Ok((triggered, workers_joined && nodes_ready))
    }

    async fn remove(&self, injected: &[Injected]) {
        for resource in injected.iter().rev() {
            match resource {
                Injected::SaturationJob { namespace, name } => {
                    match self.cx.cluster.delete_job(namespace, name).await {
                        Ok(()) => info!(job = %name, "saturation job deleted"),
                        Err(err) => error!(job = %name, %err, "failed to delete saturation job"),
                    }
                }
                Injected::Autoscalers(groups) => {
                    match self.cx.cluster.delete_autoscalers(groups).await {
                        Ok(()) => info!(groups = groups.len(), "autoscalers deleted"),
                        Err(err) => error!(%err, "failed to delete autoscalers"),
                    }
                }
                Injected::ManagedPool { .. } => {}
            }
        }
    }
}

#[async_trait]
impl<A, R, C> ScaleStrategy for AutoscalerStrategy<A, R, C>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    fn name(&self) -> &'static str {
        "autoscaler"
    }

    async fn scale(
        &self,
        request: &ScaleRequest,
        progress: &Progress,
    ) -> Result<ScaleEvent, Error> {
        let groups = self.cx.cluster.list_groups().await?;
        if groups.is_empty() && request.additional_workers > 0 {
            return Err(Error::NotFound("worker machine sets".to_owned()));
        }
        let workers = worker_count(&self.cx.cluster.list_nodes().await?);
        let mut plan = plan_allocation(
            &replicas_snapshot(&groups),
            request.additional_workers,
            self.cx.config.max_replicas_per_group,
        );
        if plan.is_empty() {
            info!("nothing to scale");
            return Ok(ScaleEvent::unchanged(self.cx.clock.now()));
        }
        if plan.increments() < request.additional_workers {
            warn!(
                requested = request.additional_workers,
                planned = plan.increments(),
                "not enough room in the machine sets, scaling less than requested"
            );
        }

        progress.enter(Phase::PlanComputed);

        let mut injected = Vec::new();
        match self
            .inject_and_wait(&plan, workers, &mut injected, progress)
            .await
        {
            Ok((triggered, converged)) => {
                plan = plan
                    .into_iter()
                    .map(|(group, mut mutation)| {
                        mutation.last_mutation = Some(triggered);
                        (group, mutation)
                    })
                    .collect();
                Ok(ScaleEvent {
                    plan,
                    reference: Reference::Uniform(triggered),
                    converged,
                    injected,
                })
            }
            Err(err) => {
                error!(%err, "autoscaler scale failed, removing injected resources");
                self.remove(&injected).await;
                Err(err)
            }
        }
    }

    async fn cleanup(&self, event: &ScaleEvent, restore: bool) {
        self.remove(&event.injected).await;
        if restore {
            ScaleDriver::new(self.cx.clone()).restore(&event.plan).await;
        }
    }
}
