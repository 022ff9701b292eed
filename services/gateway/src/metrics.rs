//! Prometheus metrics exposition
//!
//! The library crates emit these counters through the `metrics` facade:
//!
//! - `gateway_token_renewals_total` (counter): labels `kind`, `outcome`
//! - `gateway_auth_retries_total` (counter): label `outcome`
//! - `gateway_job_polls_total` (counter): label `outcome`
//! - `gateway_stream_lines_total` (counter): label `outcome`
//!
//! This module adds the service's own gauge and installs the recorder.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Whether the gateway currently holds a usable access token.
pub fn set_token_valid(valid: bool) {
    metrics::gauge!("gateway_token_valid").set(if valid { 1.0 } else { 0.0 });
}
