//! Metrics collection for the relay daemon.
//!
//! A thin layer over the `metrics` facade. With the `prometheus` feature the
//! recorder exports in Prometheus text format via [`MetricsHandle::render`];
//! without it every recording is a no-op. Recording is always best-effort:
//! nothing in the call path depends on it.

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
