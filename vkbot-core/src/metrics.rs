// ABOUTME: Metric names, descriptions and the optional Prometheus exporter
// ABOUTME: Recording goes through the `metrics` facade so it is a no-op until an exporter is installed

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

pub use vkbot_api::telemetry::{
    BATCHES_TOTAL, BATCH_FAILURES_TOTAL, CALLS_TOTAL, CAPTCHA_TOTAL, QUEUE_DEPTH, REAUTH_TOTAL,
};
pub const LONGPOLL_RESYNC_TOTAL: &str = "longpoll_resync_total";
pub const LONGPOLL_EVENTS_TOTAL: &str = "longpoll_events_total";
pub const DISPATCH_FAULTS_TOTAL: &str = "dispatch_faults_total";

/// Register descriptions for every metric the bot emits
pub fn describe_metrics() {
    describe_counter!(BATCHES_TOTAL, "Execute requests sent to VK");
    describe_counter!(CALLS_TOTAL, "API calls carried inside execute batches");
    describe_counter!(BATCH_FAILURES_TOTAL, "Batches that failed every contained call");
    describe_counter!(REAUTH_TOTAL, "Re-authentication attempts after auth or internal errors");
    describe_counter!(CAPTCHA_TOTAL, "Captcha challenges received");
    describe_gauge!(QUEUE_DEPTH, "Calls waiting in a client queue after the last drain");
    describe_counter!(LONGPOLL_RESYNC_TOTAL, "Long-poll renegotiations by mode");
    describe_counter!(LONGPOLL_EVENTS_TOTAL, "Updates received from the long-poll server");
    describe_counter!(DISPATCH_FAULTS_TOTAL, "Command handler faults reported with a reference code");
}

/// Install the Prometheus exporter with an HTTP listener on `listen`.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", listen))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    describe_metrics();
    tracing::info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_longpoll_resync(mode: &'static str) {
    metrics::counter!(LONGPOLL_RESYNC_TOTAL, "mode" => mode).increment(1);
}

pub fn record_longpoll_events(count: usize) {
    metrics::counter!(LONGPOLL_EVENTS_TOTAL).increment(count as u64);
}

pub fn record_dispatch_fault() {
    metrics::counter!(DISPATCH_FAULTS_TOTAL).increment(1);
}
