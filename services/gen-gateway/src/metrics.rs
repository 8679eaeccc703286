//! Prometheus metrics exposition
//!
//! Metrics recorded by the gateway itself:
//!
//! - `gateway_requests_total` (counter): label `outcome`
//! - `gateway_request_duration_seconds` (histogram): label `outcome`
//!
//! The key-pool crate records `gateway_upstream_errors_total{kind}`,
//! `pool_quarantines_total{reason}` and `quota_rejections_total{reason}`
//! through the same global recorder.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const REQUEST_DURATION: &str = "gateway_request_duration_seconds";

/// Upper bounds cover fast local refusals up to retried generation calls.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0,
];

fn builder() -> Result<PrometheusBuilder> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(REQUEST_DURATION.to_string()), DURATION_BUCKETS)
        .context("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Explicit buckets make the duration metric render as a histogram with
/// `_bucket` lines instead of the default summary.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished `/v1/generate` request.
pub fn record_request(outcome: &'static str, duration_secs: f64) {
    metrics::counter!("gateway_requests_total", "outcome" => outcome).increment(1);
    metrics::histogram!(REQUEST_DURATION, "outcome" => outcome).record(duration_secs);
}
