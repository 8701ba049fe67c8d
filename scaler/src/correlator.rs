use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use nodescale_common::latency::{
    LatencyDimension, LatencyRecord, QuantileSummary, Quantiles, LATENCY_METRIC_NAME,
    QUANTILES_METRIC_NAME,
};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{inspector::MachineRecord, planner::GroupMutationPlan, watcher::NodeReadinessSignal};

/// Instant latencies are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    /// Mutation time of the group the machine belongs to.
    PerGroup,
    /// A single instant for every machine.
    Uniform(DateTime<Utc>),
}

/// Identifying fields stamped on every document of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLabels {
    /// Correlation id.
    pub uuid: String,
    /// Job name.
    pub job_name: String,
    /// Caller supplied labels.
    pub metadata: BTreeMap<String, Value>,
}

/// Group a machine belongs to, its name up to the last `-`.
pub fn group_of(machine: &str) -> Option<&str> {
    machine.rsplit_once('-').map(|(group, _)| group)
}

/// Latency record of every new machine whose node reported ready.
///
/// Machines without a reference time, a node or a readiness signal are left
/// out. A machine without a provider ready time keeps its other latencies.
pub fn correlate(
    plan: &GroupMutationPlan,
    reference: Reference,
    machines: &[MachineRecord],
    signals: &HashMap<String, NodeReadinessSignal>,
    labels: &RunLabels,
) -> Vec<LatencyRecord> {
    let mut records = Vec::with_capacity(machines.len());
    for machine in machines {
        let Some(group) = group_of(&machine.name) else {
            warn!(machine = %machine.name, "machine name has no group separator, skipping");
            continue;
        };
        let reference = match reference {
            Reference::Uniform(epoch) => epoch,
            Reference::PerGroup => match plan.get(group).and_then(|m| m.last_mutation) {
                Some(time) => time,
                None => {
                    debug!(machine = %machine.name, %group, "group was not mutated, skipping");
                    continue;
                }
            },
        };
        let Some(uid) = machine.node_uid.as_ref() else {
            debug!(machine = %machine.name, "machine has no node, skipping");
            continue;
        };
        let Some(signal) = signals.get(uid) else {
            debug!(machine = %machine.name, node = %uid, "node never reported ready, skipping");
            continue;
        };
        if machine.ready.is_none() {
            debug!(machine = %machine.name, "machine has no provisioned time");
        }
        let since = |time: DateTime<Utc>| (time - reference).num_milliseconds();
        records.push(LatencyRecord {
            timestamp: machine.created,
            machine_name: machine.name.clone(),
            group_name: group.to_owned(),
            node_uid: uid.clone(),
            image_id: machine.image_id.clone(),
            machine_creation_latency: since(machine.created),
            machine_ready_latency: machine.ready.map(since),
            node_creation_latency: since(signal.created),
            node_ready_latency: since(signal.ready),
            uuid: labels.uuid.clone(),
            job_name: labels.job_name.clone(),
            metric_name: LATENCY_METRIC_NAME.to_owned(),
            metadata: labels.metadata.clone(),
        });
    }
    records
}

/// One quantile summary per latency dimension measured by at least one record.
pub fn summarize(
    records: &[LatencyRecord],
    labels: &RunLabels,
    timestamp: DateTime<Utc>,
) -> Vec<QuantileSummary> {
    LatencyDimension::ALL
        .iter()
        .filter_map(|dimension| {
            let values: Vec<i64> = records
                .iter()
                .filter_map(|r| r.latency(*dimension))
                .collect();
            Some(QuantileSummary {
                quantile_name: dimension.quantile_name().to_owned(),
                uuid: labels.uuid.clone(),
                quantiles: Quantiles::compute(&values)?,
                timestamp,
                job_name: labels.job_name.clone(),
                metric_name: QUANTILES_METRIC_NAME.to_owned(),
                metadata: labels.metadata.clone(),
            })
        })
        .collect()
}
