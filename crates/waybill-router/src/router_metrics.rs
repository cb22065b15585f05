//! Metrics infrastructure for the message router
//!
//! Provides Prometheus-compatible metrics for:
//! - Message processing counts
//! - Mediation latency
//! - Pool statistics
//! - Queue sizes

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the process-wide Prometheus recorder. Safe to call once at startup;
/// subsequent calls are no-ops and return the handle installed by the first.
pub fn install_prometheus_recorder() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Render the current metrics snapshot in Prometheus text exposition format.
/// Returns an empty scrape if the recorder was never installed (e.g. in tests
/// that build a router without going through `main`).
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

/// Record a message being processed
pub fn record_message_processed(pool_code: &str, success: bool, result: &str) {
    counter!(
        "router_messages_processed_total",
        "pool" => pool_code.to_string(),
        "success" => success.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record mediation latency
pub fn record_mediation_latency(pool_code: &str, duration: Duration) {
    histogram!(
        "router_mediation_duration_seconds",
        "pool" => pool_code.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record rate limit exceeded
pub fn record_rate_limit_exceeded(pool_code: &str) {
    counter!(
        "router_rate_limit_exceeded_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

/// Update pool queue size gauge
pub fn set_pool_queue_size(pool_code: &str, size: u32) {
    gauge!(
        "router_pool_queue_size",
        "pool" => pool_code.to_string()
    )
    .set(size as f64);
}

/// Update pool active workers gauge
pub fn set_pool_active_workers(pool_code: &str, count: u32) {
    gauge!(
        "router_pool_active_workers",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

/// Update pool message group count
pub fn set_pool_message_groups(pool_code: &str, count: u32) {
    gauge!(
        "router_pool_message_groups",
        "pool" => pool_code.to_string()
    )
    .set(count as f64);
}

/// Record a message being submitted to a pool
pub fn record_message_submitted(pool_code: &str) {
    counter!(
        "router_messages_submitted_total",
        "pool" => pool_code.to_string()
    )
    .increment(1);
}

/// Record a message being rejected (pool at capacity)
pub fn record_message_rejected(pool_code: &str, reason: &str) {
    counter!(
        "router_messages_rejected_total",
        "pool" => pool_code.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Update in-pipeline message count
pub fn set_in_pipeline_count(count: usize) {
    gauge!("router_in_pipeline_messages").set(count as f64);
}

/// Record consumer poll
pub fn record_consumer_poll(consumer: &str, message_count: u32) {
    counter!(
        "router_consumer_polls_total",
        "consumer" => consumer.to_string()
    )
    .increment(1);

    if message_count > 0 {
        counter!(
            "router_consumer_messages_received_total",
            "consumer" => consumer.to_string()
        )
        .increment(message_count as u64);
    }
}

/// Record consumer error
pub fn record_consumer_error(consumer: &str, error_type: &str) {
    counter!(
        "router_consumer_errors_total",
        "consumer" => consumer.to_string(),
        "type" => error_type.to_string()
    )
    .increment(1);
}
