//! Provides types and functions that are shared by the scaler and its tooling.
#![deny(missing_docs)]
pub mod latency;
#[cfg(feature = "telemetry")]
pub mod telemetry;
