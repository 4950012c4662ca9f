//! Prometheus metrics exposition
//!
//! Registers and exposes the gateway metrics:
//!
//! - `gateway_requests_total` (counter): labels `status`, `provider`
//! - `gateway_request_duration_seconds` (histogram): label `provider`
//! - `gateway_upstream_errors_total` (counter): labels `provider`, `status`
//! - `gateway_account_cooldowns_total` (counter): label `provider`
//! - `gateway_token_refresh_total` (counter): labels `provider`, `outcome`
//!
//! The codec additionally emits `cursor_gzip_fallback_total` whenever a
//! frame marked gzip fails to decompress and is consumed raw.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed gateway request.
pub fn record_request(status: u16, provider: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("gateway_requests_total", "status" => status_str, "provider" => provider.to_string())
        .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "provider" => provider.to_string())
        .record(duration_secs);
}

/// Record an upstream failure as classified by the dispatch loop.
pub fn record_upstream_error(provider: &str, status: u16) {
    metrics::counter!("gateway_upstream_errors_total", "provider" => provider.to_string(), "status" => status.to_string())
        .increment(1);
}

/// Record a connection entering cooldown.
pub fn record_cooldown(provider: &str) {
    metrics::counter!("gateway_account_cooldowns_total", "provider" => provider.to_string())
        .increment(1);
}

/// Record a token refresh attempt outcome.
pub fn record_token_refresh(provider: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!("gateway_token_refresh_total", "provider" => provider.to_string(), "outcome" => outcome)
        .increment(1);
}
