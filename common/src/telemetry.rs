//! Provides helper functions for initializing telemetry collection and publication.
use std::{fmt, str::FromStr, time::Duration};

use anyhow::{anyhow, Result};
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{metrics::MeterProvider, runtime, trace, Resource};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter, Layer, Registry};

/// Output format of the log lines written to stdout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Single line, human readable logs.
    #[default]
    Compact,
    /// Newline delimited JSON logs.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Handle to the installed telemetry pipelines, used to flush them on exit.
pub struct Telemetry {
    meter_provider: Option<MeterProvider>,
}

impl Telemetry {
    /// Flush pending spans and metrics.
    pub fn shutdown(self) -> Result<()> {
        if let Some(meter_provider) = self.meter_provider {
            global::shutdown_tracer_provider();
            meter_provider.shutdown()?;
        }
        Ok(())
    }
}

fn resource() -> Result<Resource> {
    let hostname = gethostname::gethostname()
        .into_string()
        .map_err(|_| anyhow!("hostname should be valid utf-8"))?;
    Ok(Resource::new(vec![
        KeyValue::new("hostname", hostname),
        KeyValue::new("service.name", "nodescale"),
    ]))
}

/// Initialize logging, and tracing and metrics export when an OTLP endpoint is given.
pub async fn init(otlp_endpoint: Option<String>, format: LogFormat) -> Result<Telemetry> {
    // Default to INFO if no env is specified
    let log_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let logger = match format {
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_filter(log_filter)
            .boxed(),
    };

    let Some(otlp_endpoint) = otlp_endpoint else {
        tracing::subscriber::set_global_default(Registry::default().with(logger))?;
        return Ok(Telemetry {
            meter_provider: None,
        });
    };

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint.clone()),
        )
        .with_trace_config(trace::config().with_resource(resource()?))
        .install_batch(runtime::Tokio)?;

    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint),
        )
        .with_resource(resource()?)
        .with_period(Duration::from_secs(10))
        .build()?;
    global::set_meter_provider(meter_provider.clone());

    let otlp_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;
    let telemetry = tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(otlp_filter);

    let collector = Registry::default().with(logger).with(telemetry);
    tracing::subscriber::set_global_default(collector)?;

    Ok(Telemetry {
        meter_provider: Some(meter_provider),
    })
}
