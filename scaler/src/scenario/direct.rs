use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;
use tracing::{error, info, warn};

use crate::{
    correlator::Reference,
    driver::ScaleDriver,
    inspector::{replicas_snapshot, ClusterApi},
    planner::plan_allocation,
    scenario::{Phase, Progress, ScaleEvent, ScaleRequest, ScaleStrategy},
    utils::{Clock, Context},
    Error,
};

/// Grows machine sets by editing their replica counts.
pub struct DirectStrategy<A, R, C> {
    cx: Arc<Context<A, R, C>>,
}

impl<A, R, C> DirectStrategy<A, R, C> {
    /// Create the strategy.
    pub fn new(cx: Arc<Context<A, R, C>>) -> Self {
        Self { cx }
    }
}

#[async_trait]
impl<A, R, C> ScaleStrategy for DirectStrategy<A, R, C>
where
    A: ClusterApi + 'static,
    R: RngCore + Send + 'static,
    C: Clock + 'static,
{
    fn name(&self) -> &'static str {
        "direct"
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
        let plan = plan_allocation(
            &replicas_snapshot(&groups),
            request.additional_workers,
            self.cx.config.max_replicas_per_group,
        );
        if plan.increments() < request.additional_workers {
            warn!(
                requested = request.additional_workers,
                planned = plan.increments(),
                "not enough room in the machine sets, scaling less than requested"
            );
        }
        info!(groups = plan.len(), workers = plan.increments(), "plan computed");
        progress.enter(Phase::PlanComputed);

        let driver = ScaleDriver::new(self.cx.clone()).reporting(progress);
        let convergence = match driver.apply(plan.clone()).await {
            Ok(convergence) => convergence,
            Err(err) => {
                error!(%err, "direct scale failed");
                if request.restore {
                    driver.restore(&plan).await;
                }
                return Err(err);
            }
        };
        Ok(ScaleEvent {
            converged: convergence.complete(),
            plan: convergence.plan,
            reference: Reference::PerGroup,
            injected: Vec::new(),
        })
    }

    async fn cleanup(&self, event: &ScaleEvent, restore: bool) {
        if restore {
            ScaleDriver::new(self.cx.clone()).restore(&event.plan).await;
        }
    }
}
