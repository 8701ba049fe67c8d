use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use tokio::time::sleep;
use tracing::{error, info, instrument};

use crate::{
    correlator::Reference,
    driver::ScaleDriver,
    inspector::{worker_count, ClusterApi},
    planner::{GroupMutation, GroupMutationPlan},
    scenario::{
        job::saturation_job_spec, rosa::ManagedPoolCli, Injected, Phase, PoolBounds, Progress,
        ScaleEvent, ScaleRequest, ScaleStrategy,
    },
    utils::{Clock, Context},
    Error,
};

/// Grows a machine pool of a managed cluster through the managed control plane.
pub struct ManagedStrategy<A, R, C, P> {
    cx: Arc<Context<A, R, C>>,
    cli: P,
    cluster_id: String,
    pool: String,
}

impl<A, R, C, P> ManagedStrategy<A, R, C, P>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
    P: ManagedPoolCli,
{
    /// Create the strategy for a pool of the managed cluster.
    pub fn new(
        cx: Arc<Context<A, R, C>>,
        cli: P,
        cluster_id: impl Into<String>,
        pool: impl Into<String>,
    ) -> Self {
        Self {
            cx,
            cli,
            cluster_id: cluster_id.into(),
            pool: pool.into(),
        }
    }

    async fn edit(&self, bounds: &PoolBounds) -> Result<DateTime<Utc>, Error> {
        self.cli
            .edit_pool(&self.cluster_id, &self.pool, bounds)
            .await
            .map_err(|source| Error::Cli { source })
    }

    async fn wait(
        &self,
        request: &ScaleRequest,
        target: usize,
        injected: &mut Vec<Injected>,
    ) -> Result<bool, Error> {
        if request.autoscale {
            let saturation = &self.cx.config.saturation;
            let name = format!("nodescale-saturation-{}", self.cx.random_suffix(5));
            let spec = saturation_job_spec(saturation, target as i32, self.cx.config.timeout);
            self.cx
                .cluster
                .create_job(&saturation.namespace, &name, spec)
                .await?;
            injected.push(Injected::SaturationJob {
                namespace: saturation.namespace.clone(),
                name,
            });
        } else {
            sleep(self.cx.config.managed_settle).await;
        }

        let driver = ScaleDriver::new(self.cx.clone());
        let workers_joined = driver.wait_for_worker_count(target).await?;
        let nodes_ready = driver.wait_for_nodes_ready().await?;
        Ok(workers_joined && nodes_ready)
    }

    async fn remove(&self, injected: &[Injected], restore: bool) {
        for resource in injected.iter().rev() {
            match resource {
                Injected::SaturationJob { namespace, name } => {
                    match self.cx.cluster.delete_job(namespace, name).await {
                        Ok(()) => info!(job = %name, "saturation job deleted"),
                        Err(err) => error!(job = %name, %err, "failed to delete saturation job"),
                    }
                }
                Injected::ManagedPool { previous } if restore => match self.edit(previous).await {
                    Ok(_) => info!(pool = %self.pool, bounds = ?previous, "machine pool restored"),
                    Err(err) => error!(pool = %self.pool, %err, "failed to restore machine pool"),
                },
                Injected::ManagedPool { .. } | Injected::Autoscalers(_) => {}
            }
        }
    }
}

#[async_trait]
impl<A, R, C, P> ScaleStrategy for ManagedStrategy<A, R, C, P>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
    P: ManagedPoolCli,
{
    fn name(&self) -> &'static str {
        "managed"
    }

    async fn preflight(&self) -> Result<(), Error> {
        self.cli
            .verify()
            .await
            .map_err(|source| Error::Cli { source })
    }

    #[instrument(skip_all, fields(cluster = %self.cluster_id, pool = %self.pool))]
    async fn scale(
        &self,
        request: &ScaleRequest,
        progress: &Progress,
    ) -> Result<ScaleEvent, Error> {
        if request.additional_workers == 0 {
            info!("nothing to scale");
            return Ok(ScaleEvent::unchanged(self.cx.clock.now()));
        }
        let previous = self
            .cli
            .describe_pool(&self.cluster_id, &self.pool)
            .await
            .map_err(|source| Error::Cli { source })?;
        let current = previous.baseline();
        let target = current + request.additional_workers as i32;
        let bounds = if request.autoscale {
            PoolBounds::Autoscaling {
                min: current,
                max: target,
            }
        } else {
            PoolBounds::Fixed(target)
        };
        let workers = worker_count(&self.cx.cluster.list_nodes().await?);
        progress.enter(Phase::PlanComputed);

        progress.enter(Phase::Mutating);
        let triggered = self.edit(&bounds).await?;
        info!(?previous, ?bounds, %triggered, "machine pool edited");
        let mut injected = vec![Injected::ManagedPool { previous }];

        let wanted = workers + request.additional_workers as usize;
        progress.enter(Phase::Converging);
        match self.wait(request, wanted, &mut injected).await {
            Ok(converged) => Ok(ScaleEvent {
                plan: GroupMutationPlan::from_iter(vec![(
                    self.pool.clone(),
                    GroupMutation {
                        previous_replicas: current,
                        target_replicas: target,
                        last_mutation: Some(triggered),
                    },
                )]),
                reference: Reference::Uniform(triggered),
                converged,
                injected,
            }),
            Err(err) => {
                error!(%err, "managed scale failed, reverting the machine pool");
                self.remove(&injected, true).await;
                Err(err)
            }
        }
    }

    async fn cleanup(&self, event: &ScaleEvent, restore: bool) {
        self.remove(&event.injected, restore).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::anyhow;
    use test_log::test;

    use super::*;
    use crate::{
        scenario::{rosa::MockManagedPoolCli, tests::request},
        utils::test::{base_time, CollectingIndexer, FakeCluster},
    };

    const GROUP: &str = "c-worker-a";

    /// CLI whose pool edits set the desired count of the fake group.
    fn pool_cli(
        cluster: &FakeCluster,
        describe: PoolBounds,
        edits: Arc<Mutex<Vec<PoolBounds>>>,
    ) -> MockManagedPoolCli {
        let mut cli = MockManagedPoolCli::new();
        cli.expect_verify().returning(|| Ok(()));
        cli.expect_describe_pool()
            .returning(move |_, _| Ok(describe));
        let cluster = cluster.clone();
        cli.expect_edit_pool().returning(move |_, _, bounds| {
            let desired = match bounds {
                PoolBounds::Fixed(replicas) => *replicas,
                PoolBounds::Autoscaling { max, .. } => *max,
            };
            if let Some(group) = cluster.lock().groups.get_mut(GROUP) {
                group.desired_replicas = desired;
            }
            edits.lock().unwrap().push(*bounds);
            Ok(base_time())
        });
        cli
    }

    #[test(tokio::test)]
    async fn fixed_pool_grows_and_restores() {
        let cluster = FakeCluster::new(&[(GROUP, 2)]);
        let edits = Arc::new(Mutex::new(Vec::new()));
        let strategy = ManagedStrategy::new(
            Context::test(cluster.clone()),
            pool_cli(&cluster, PoolBounds::Fixed(2), edits.clone()),
            "c1",
            "workers",
        );
        strategy.preflight().await.unwrap();
        let event = strategy
            .scale(
                &request(2, Arc::new(CollectingIndexer::default())),
                &Progress::default(),
            )
            .await
            .unwrap();

        assert!(event.converged);
        assert_eq!(event.reference, Reference::Uniform(base_time()));
        assert_eq!(
            event.plan.get("workers"),
            Some(&GroupMutation {
                previous_replicas: 2,
                target_replicas: 4,
                last_mutation: Some(base_time()),
            })
        );
        assert_eq!(cluster.worker_count(), 4);

        strategy.cleanup(&event, true).await;
        assert_eq!(
            *edits.lock().unwrap(),
            vec![PoolBounds::Fixed(4), PoolBounds::Fixed(2)]
        );
    }

    #[test(tokio::test)]
    async fn autoscaling_pool_uses_saturation_job() {
        let cluster = FakeCluster::new(&[(GROUP, 1)]);
        let edits = Arc::new(Mutex::new(Vec::new()));
        let previous = PoolBounds::Autoscaling { min: 1, max: 3 };
        let strategy = ManagedStrategy::new(
            Context::test(cluster.clone()),
            pool_cli(&cluster, previous, edits.clone()),
            "c1",
            "workers",
        );
        let mut request = request(2, Arc::new(CollectingIndexer::default()));
        request.autoscale = true;
        let event = strategy
            .scale(&request, &Progress::default())
            .await
            .unwrap();

        assert!(event.converged);
        assert_eq!(cluster.lock().jobs[0].2.parallelism, Some(3));

        strategy.cleanup(&event, true).await;
        assert_eq!(
            *edits.lock().unwrap(),
            vec![PoolBounds::Autoscaling { min: 1, max: 3 }, previous]
        );
        assert_eq!(cluster.lock().deleted_jobs.len(), 1);
    }

    #[test(tokio::test)]
    async fn keeps_pool_without_restore() {
        let cluster = FakeCluster::new(&[(GROUP, 1)]);
        let edits = Arc::new(Mutex::new(Vec::new()));
        let strategy = ManagedStrategy::new(
            Context::test(cluster.clone()),
            pool_cli(&cluster, PoolBounds::Fixed(1), edits.clone()),
            "c1",
            "workers",
        );
        let event = strategy
            .scale(
                &request(1, Arc::new(CollectingIndexer::default())),
                &Progress::default(),
            )
            .await
            .unwrap();
        strategy.cleanup(&event, false).await;
        assert_eq!(*edits.lock().unwrap(), vec![PoolBounds::Fixed(2)]);
    }

    #[test(tokio::test)]
    async fn zero_workers_does_not_edit() {
        let cluster = FakeCluster::new(&[(GROUP, 1)]);
        // no expectations, any call fails the test
        let strategy = ManagedStrategy::new(
            Context::test(cluster.clone()),
            MockManagedPoolCli::new(),
            "c1",
            "workers",
        );
        let event = strategy
            .scale(
                &request(0, Arc::new(CollectingIndexer::default())),
                &Progress::default(),
            )
            .await
            .unwrap();
        assert!(event.plan.is_empty());
    }

    #[test(tokio::test)]
    async fn cli_failures_are_reported() {
        let cluster = FakeCluster::new(&[(GROUP, 1)]);
        let mut cli = MockManagedPoolCli::new();
        cli.expect_verify()
            .returning(|| Err(anyhow!("not logged in")));
        let strategy = ManagedStrategy::new(Context::test(cluster), cli, "c1", "workers");
        let err = strategy.preflight().await.unwrap_err();
        assert!(matches!(err, Error::Cli { .. }), "{err:?}");
    }
}
