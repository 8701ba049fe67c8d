use std::{path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use clap::{ArgAction, Args, ValueEnum};

/// Options to the workers-scale command
#[derive(Args, Debug, Clone)]
pub struct Opts {
    /// Number of worker nodes to add to the cluster.
    #[arg(long, default_value_t = 3, env = "NODESCALE_ADDITIONAL_WORKER_NODES")]
    pub additional_worker_nodes: u32,

    /// Trigger the scale up through the cluster autoscaler instead of editing
    /// replica counts directly.
    #[arg(long, env = "NODESCALE_ENABLE_AUTOSCALER")]
    pub enable_autoscaler: bool,

    /// Unix time in seconds of a scale event triggered outside of this tool.
    /// When set the cluster is not mutated and every latency is measured
    /// against this instant. Zero disables it.
    #[arg(long, default_value_t = 0, env = "NODESCALE_SCALE_EVENT_EPOCH")]
    pub scale_event_epoch: i64,

    /// Restore the previous replica counts once measured.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "NODESCALE_GC")]
    pub gc: bool,

    /// Correlation id attached to every document, generated when absent.
    #[arg(long, env = "NODESCALE_UUID")]
    pub uuid: Option<String>,

    /// Name of the job reported in every document.
    #[arg(long, default_value = "workers-scale", env = "NODESCALE_JOB_NAME")]
    pub job_name: String,

    /// YAML file with extra labels attached to every document.
    #[arg(long, env = "NODESCALE_USER_METADATA")]
    pub user_metadata: Option<PathBuf>,

    /// Kind of cluster, detected from the Infrastructure object when auto.
    #[arg(long, value_enum, default_value_t = ClusterType::Auto, env = "NODESCALE_CLUSTER_TYPE")]
    pub cluster_type: ClusterType,

    /// Id of the managed cluster, used with the managed CLI.
    #[arg(long, env = "NODESCALE_MC_CLUSTER_ID")]
    pub mc_cluster_id: Option<String>,

    /// Managed node pool to grow.
    #[arg(long, default_value = "workers", env = "NODESCALE_MACHINE_POOL")]
    pub machine_pool: String,

    /// Maximum time to wait for each convergence phase, i.e. 30s, 5m, 1h.
    #[arg(long, value_parser = parse_duration, env = "NODESCALE_TIMEOUT")]
    pub timeout: Option<Duration>,

    /// Interval between two polls of the cluster.
    #[arg(long, value_parser = parse_duration, env = "NODESCALE_POLL_INTERVAL")]
    pub poll_interval: Option<Duration>,

    /// Time given to the cluster autoscaler before polling.
    #[arg(long, value_parser = parse_duration, env = "NODESCALE_AUTOSCALER_WARMUP")]
    pub autoscaler_warmup: Option<Duration>,

    /// Time given to the managed control plane after editing a pool.
    #[arg(long, value_parser = parse_duration, env = "NODESCALE_MANAGED_SETTLE")]
    pub managed_settle: Option<Duration>,

    /// Replica count a single provisioning group is never grown beyond.
    #[arg(long, env = "NODESCALE_MAX_REPLICAS_PER_GROUP")]
    pub max_replicas_per_group: Option<i32>,

    /// Namespace of the saturation job.
    #[arg(long, env = "NODESCALE_SATURATION_NAMESPACE")]
    pub saturation_namespace: Option<String>,

    /// Image of the saturation job pods.
    #[arg(long, env = "NODESCALE_SATURATION_IMAGE")]
    pub saturation_image: Option<String>,

    /// CPU request of each saturation pod.
    #[arg(long, env = "NODESCALE_SATURATION_CPU_REQUEST")]
    pub saturation_cpu_request: Option<String>,

    /// Elasticsearch or OpenSearch endpoint, documents are written locally when absent.
    #[arg(long, env = "NODESCALE_ES_SERVER")]
    pub es_server: Option<String>,

    /// Index receiving the documents.
    #[arg(long, default_value = "nodescale", env = "NODESCALE_ES_INDEX")]
    pub es_index: String,

    /// Directory of the local indexer.
    #[arg(long, default_value = "collected-metrics", env = "NODESCALE_METRICS_DIRECTORY")]
    pub metrics_directory: PathBuf,
}

/// Kind of cluster the run targets.
#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClusterType {
    /// Inspect the cluster to decide.
    Auto,
    /// Machine sets are edited by this tool.
    SelfManaged,
    /// Node pools are edited through the managed control plane CLI.
    Managed,
}

/// Shape of the job used to push the cluster autoscaler.
#[derive(Debug, Clone, PartialEq)]
pub struct SaturationConfig {
    /// Namespace the job runs in.
    pub namespace: String,
    /// Image of the pods.
    pub image: String,
    /// CPU request of each pod.
    pub cpu_request: String,
}

impl Default for SaturationConfig {
    fn default() -> Self {
        Self {
            namespace: "nodescale".to_owned(),
            image: "registry.access.redhat.com/ubi9/ubi-minimal:latest".to_owned(),
            cpu_request: "100m".to_owned(),
        }
    }
}

/// Timing and sizing knobs of a scale run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleConfig {
    /// Bound of each convergence wait.
    pub timeout: Duration,
    /// Interval between polls.
    pub poll_interval: Duration,
    /// Delay before polling when the autoscaler drives the change.
    pub autoscaler_warmup: Duration,
    /// Delay after editing a managed pool without autoscaling.
    pub managed_settle: Duration,
    /// Replica cap of a single group.
    pub max_replicas_per_group: Option<i32>,
    /// Saturation job shape.
    pub saturation: SaturationConfig,
}

impl Default for ScaleConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60 * 60),
            poll_interval: Duration::from_secs(1),
            autoscaler_warmup: Duration::from_secs(5 * 60),
            managed_settle: Duration::from_secs(60),
            max_replicas_per_group: None,
            saturation: SaturationConfig::default(),
        }
    }
}

impl From<&Opts> for ScaleConfig {
    fn from(opts: &Opts) -> Self {
        let default = Self::default();
        Self {
            timeout: opts.timeout.unwrap_or(default.timeout),
            poll_interval: opts.poll_interval.unwrap_or(default.poll_interval),
            autoscaler_warmup: opts.autoscaler_warmup.unwrap_or(default.autoscaler_warmup),
            managed_settle: opts.managed_settle.unwrap_or(default.managed_settle),
            max_replicas_per_group: opts.max_replicas_per_group,
            saturation: SaturationConfig {
                namespace: opts
                    .saturation_namespace
                    .to_owned()
                    .unwrap_or(default.saturation.namespace),
                image: opts
                    .saturation_image
                    .to_owned()
                    .unwrap_or(default.saturation.image),
                cpu_request: opts
                    .saturation_cpu_request
                    .to_owned()
                    .unwrap_or(default.saturation.cpu_request),
            },
        }
    }
}

/// Parse a duration such as `30s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (amount, unit) = value.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| anyhow!("invalid duration: {value}"))?;
    let seconds = match unit {
        "" | "s" => Some(amount),
        "m" => amount.checked_mul(60),
        "h" => amount.checked_mul(60 * 60),
        "ms" => return Ok(Duration::from_millis(amount)),
        _ => return Err(anyhow!("invalid duration unit: {unit}")),
    };
    let seconds = seconds.ok_or_else(|| anyhow!("duration is too large: {value}"))?;
    Ok(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        opts: Opts,
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("42").unwrap(), Duration::from_secs(42));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let max = u64::MAX.to_string();
        assert_eq!(
            parse_duration(&max).unwrap(),
            Duration::from_secs(u64::MAX)
        );
        let err = parse_duration(&format!("{max}h")).unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");
        assert!(parse_duration(&format!("{}m", u64::MAX / 30)).is_err());
        assert!(parse_duration("99999999999999999999s").is_err());
    }

    #[test]
    fn defaults_from_opts() {
        let cli = Cli::parse_from(["nodescale"]);
        assert_eq!(cli.opts.additional_worker_nodes, 3);
        assert!(cli.opts.gc);
        assert_eq!(cli.opts.cluster_type, ClusterType::Auto);
        assert_eq!(ScaleConfig::from(&cli.opts), ScaleConfig::default());
    }

    #[test]
    fn overrides_from_opts() {
        let cli = Cli::parse_from([
            "nodescale",
            "--gc",
            "false",
            "--timeout",
            "10m",
            "--max-replicas-per-group",
            "5",
            "--saturation-image",
            "busybox",
            "--cluster-type",
            "self-managed",
        ]);
        let config = ScaleConfig::from(&cli.opts);
        assert!(!cli.opts.gc);
        assert_eq!(cli.opts.cluster_type, ClusterType::SelfManaged);
        assert_eq!(config.timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.max_replicas_per_group, Some(5));
        assert_eq!(config.saturation.image, "busybox");
        assert_eq!(config.saturation.namespace, "nodescale");
    }
}
