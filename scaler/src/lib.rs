//! Measures how quickly a cluster adds worker capacity.
#![warn(missing_docs)]

/// Configuration of a scale run.
pub mod config;
/// Correlates new machines with node readiness signals.
pub mod correlator;
/// Drives replica changes and waits for convergence.
pub mod driver;
mod error;
/// Sinks for latency documents.
pub mod indexer;
/// Reads and mutates cluster state.
pub mod inspector;
pub(crate) mod labels;
/// Decides which provisioning groups to grow.
pub mod planner;
/// Scaling strategies and the orchestration of a run.
pub mod scenario;
/// Shared context and kube helpers.
pub mod utils;
/// Observes node readiness while a run is in progress.
pub mod watcher;
/// Entry point of the workers-scale command.
pub mod workers_scale;

pub use error::Error;

/// Field manager and managed-by value of resources created by a run.
const CONTROLLER_NAME: &str = "nodescale";
