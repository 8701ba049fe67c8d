//! Latency documents produced by a worker scale run.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metric name of the per machine latency documents.
pub const LATENCY_METRIC_NAME: &str = "workerScaleLatencyMeasurement";
/// Metric name of the quantile summary documents.
pub const QUANTILES_METRIC_NAME: &str = "workerScaleLatencyQuantilesMeasurement";

/// The four measured phases of adding a worker.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LatencyDimension {
    /// Machine object created.
    MachineCreation,
    /// Machine reported its instance as provisioned.
    MachineReady,
    /// Node object registered.
    NodeCreation,
    /// Node reported Ready.
    NodeReady,
}

impl LatencyDimension {
    /// All dimensions in pipeline order.
    pub const ALL: [LatencyDimension; 4] = [
        LatencyDimension::MachineCreation,
        LatencyDimension::MachineReady,
        LatencyDimension::NodeCreation,
        LatencyDimension::NodeReady,
    ];

    /// Name used for the quantile document of this dimension.
    pub fn quantile_name(&self) -> &'static str {
        match self {
            LatencyDimension::MachineCreation => "MachineCreationLatency",
            LatencyDimension::MachineReady => "MachineReadyLatency",
            LatencyDimension::NodeCreation => "NodeCreationLatency",
            LatencyDimension::NodeReady => "NodeReadyLatency",
        }
    }
}

/// Latencies of a single new machine, in milliseconds since the scale event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRecord {
    /// Creation time of the machine.
    pub timestamp: DateTime<Utc>,
    /// Name of the machine.
    pub machine_name: String,
    /// Provisioning group the machine belongs to.
    pub group_name: String,
    /// UID of the node the machine registered.
    pub node_uid: String,
    /// Image the machine was booted from, when the provider reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Machine creation latency.
    pub machine_creation_latency: i64,
    /// Machine ready latency, when the provider reports when the machine was
    /// provisioned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_ready_latency: Option<i64>,
    /// Node creation latency.
    pub node_creation_latency: i64,
    /// Node ready latency.
    pub node_ready_latency: i64,
    /// Correlation id of the run.
    pub uuid: String,
    /// Job that produced the document.
    pub job_name: String,
    /// Always [`LATENCY_METRIC_NAME`].
    pub metric_name: String,
    /// Caller supplied labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl LatencyRecord {
    /// Report the latency of one dimension, None when it was not measured.
    pub fn latency(&self, dimension: LatencyDimension) -> Option<i64> {
        match dimension {
            LatencyDimension::MachineCreation => Some(self.machine_creation_latency),
            LatencyDimension::MachineReady => self.machine_ready_latency,
            LatencyDimension::NodeCreation => Some(self.node_creation_latency),
            LatencyDimension::NodeReady => Some(self.node_ready_latency),
        }
    }
}

/// Aggregated statistics of a set of latencies.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Quantiles {
    /// 99th percentile.
    #[serde(rename = "P99")]
    pub p99: i64,
    /// 95th percentile.
    #[serde(rename = "P95")]
    pub p95: i64,
    /// Median.
    #[serde(rename = "P50")]
    pub p50: i64,
    /// Smallest value.
    pub min: i64,
    /// Largest value.
    pub max: i64,
    /// Integer mean.
    pub avg: i64,
}

impl Quantiles {
    /// Compute statistics over the values, None when there are no values.
    ///
    /// Percentiles use the nearest-rank method.
    pub fn compute(values: &[i64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        let sum: i128 = sorted.iter().map(|v| *v as i128).sum();
        Some(Self {
            p99: nearest_rank(&sorted, 99.0),
            p95: nearest_rank(&sorted, 95.0),
            p50: nearest_rank(&sorted, 50.0),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: (sum / sorted.len() as i128) as i64,
        })
    }
}

fn nearest_rank(sorted: &[i64], percentile: f64) -> i64 {
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Quantile summary of one latency dimension over a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuantileSummary {
    /// See [`LatencyDimension::quantile_name`].
    pub quantile_name: String,
    /// Correlation id of the run.
    pub uuid: String,
    /// Computed statistics.
    #[serde(flatten)]
    pub quantiles: Quantiles,
    /// Time the summary was produced.
    pub timestamp: DateTime<Utc>,
    /// Job that produced the document.
    pub job_name: String,
    /// Always [`QUANTILES_METRIC_NAME`].
    pub metric_name: String,
    /// Caller supplied labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}
