use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::scenario::PoolBounds;

/// Control plane of a managed cluster, reached through its CLI.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManagedPoolCli: Send + Sync {
    /// Check the CLI is installed and logged in.
    async fn verify(&self) -> Result<()>;
    /// Read the bounds of a machine pool.
    async fn describe_pool(&self, cluster: &str, pool: &str) -> Result<PoolBounds>;
    /// Set the bounds of a machine pool, returning when the edit was issued.
    async fn edit_pool(&self, cluster: &str, pool: &str, bounds: &PoolBounds)
        -> Result<DateTime<Utc>>;
}

/// Drives machine pools with the `rosa` binary.
pub struct RosaCli {
    binary: String,
}

impl Default for RosaCli {
    fn default() -> Self {
        Self {
            binary: "rosa".to_owned(),
        }
    }
}

impl RosaCli {
    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(binary = %self.binary, ?args, "running");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|err| anyhow!("failed to run {}: {err}", self.binary))?;
        if !output.status.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )
        }
        Ok(String::from_utf8(output.stdout)?)
    }
}

#[async_trait]
impl ManagedPoolCli for RosaCli {
    async fn verify(&self) -> Result<()> {
        let whoami = self.run(&["whoami".to_owned()]).await?;
        debug!(%whoami, "logged in");
        Ok(())
    }

    async fn describe_pool(&self, cluster: &str, pool: &str) -> Result<PoolBounds> {
        let out = self.run(&describe_args(cluster, pool)).await?;
        parse_pool(&out)
    }

    async fn edit_pool(
        &self,
        cluster: &str,
        pool: &str,
        bounds: &PoolBounds,
    ) -> Result<DateTime<Utc>> {
        let issued = Utc::now();
        self.run(&edit_args(cluster, pool, bounds)).await?;
        info!(cluster, pool, ?bounds, "machine pool edited");
        Ok(issued)
    }
}

fn describe_args(cluster: &str, pool: &str) -> Vec<String> {
    vec![
        "describe".to_owned(),
        "machinepool".to_owned(),
        format!("--cluster={cluster}"),
        format!("--machinepool={pool}"),
        "--output=json".to_owned(),
    ]
}

/// Arguments of `rosa` setting the bounds of a machine pool.
pub fn edit_args(cluster: &str, pool: &str, bounds: &PoolBounds) -> Vec<String> {
    let mut args = vec![
        "edit".to_owned(),
        "machinepool".to_owned(),
        format!("--cluster={cluster}"),
        pool.to_owned(),
    ];
    match bounds {
        PoolBounds::Fixed(replicas) => {
            args.push("--enable-autoscaling=false".to_owned());
            args.push(format!("--replicas={replicas}"));
        }
        PoolBounds::Autoscaling { min, max } => {
            args.push("--enable-autoscaling=true".to_owned());
            args.push(format!("--min-replicas={min}"));
            args.push(format!("--max-replicas={max}"));
        }
    }
    args
}

#[derive(Deserialize)]
struct MachinePool {
    #[serde(default)]
    replicas: Option<i32>,
    #[serde(default)]
    autoscaling: Option<Autoscaling>,
}

#[derive(Deserialize)]
struct Autoscaling {
    min_replicas: i32,
    max_replicas: i32,
}

/// Bounds of a machine pool described as JSON.
pub fn parse_pool(json: &str) -> Result<PoolBounds> {
    let pool: MachinePool = serde_json::from_str(json)?;
    match (pool.autoscaling, pool.replicas) {
        (Some(autoscaling), _) => Ok(PoolBounds::Autoscaling {
            min: autoscaling.min_replicas,
            max: autoscaling.max_replicas,
        }),
        (None, Some(replicas)) => Ok(PoolBounds::Fixed(replicas)),
        (None, None) => bail!("machine pool has neither replicas nor autoscaling bounds"),
    }
}
