//! Nodescale measures how quickly an OpenShift cluster adds worker nodes
#![deny(missing_docs)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use nodescale_common::telemetry::{self, LogFormat};
use nodescale_scaler::{config::Opts, workers_scale};
use opentelemetry::{global, KeyValue};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Export traces and metrics to this OTLP endpoint.
    #[arg(long, env = "NODESCALE_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Format of the logs written to stdout, compact or json.
    #[arg(long, default_value_t = LogFormat::Compact, env = "NODESCALE_LOG_FORMAT")]
    log_format: LogFormat,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
enum Command {
    /// Add worker nodes and measure how long they take to become ready
    WorkersScale(Opts),
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::WorkersScale(_) => "workers-scale",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let telemetry = telemetry::init(args.otlp_endpoint.clone(), args.log_format).await?;

    let meter = global::meter("nodescale");
    let runs = meter
        .u64_counter("nodescale_runs")
        .with_description("Number of runs of nodescale")
        .init();

    info!(?args.command, ?args.otlp_endpoint, "starting nodescale");
    let command = args.command.name();
    let result = match args.command {
        Command::WorkersScale(opts) => workers_scale::run(opts).await,
    };
    let status = match &result {
        Ok(outcome) => {
            info!(
                records = outcome.records,
                converged = outcome.converged,
                "run finished"
            );
            "success"
        }
        Err(err) => {
            error!(%err, "run failed");
            "failure"
        }
    };
    runs.add(
        1,
        &[
            KeyValue::new("command", command),
            KeyValue::new("result", status),
        ],
    );

    // Flush traces and metrics before shutdown
    telemetry.shutdown()?;
    result.map(|_| ())
}
