use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder
///
/// Fails if a recorder is already installed (e.g., a second server in the
/// same process).
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "log_beacon_ingest_total",
        "Log records submitted for ingest, by outcome"
    );
    describe_counter!(
        "log_beacon_consumer_messages_total",
        "Messages handled by durable consumers, by consumer and outcome"
    );
    describe_counter!(
        "log_beacon_search_requests_total",
        "Search requests, by outcome"
    );
    describe_histogram!(
        "log_beacon_search_duration_seconds",
        "Search duration in seconds, including hit resolution"
    );
    describe_counter!(
        "log_beacon_tail_dropped_total",
        "Records dropped because a tail client's buffer was full"
    );
    describe_gauge!("log_beacon_tail_sessions", "Open live-tail sessions");
    describe_gauge!("log_beacon_info", "Build information");

    gauge!("log_beacon_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record an ingest attempt (`accepted`, `rejected`, `publish_failed`)
pub fn record_ingest(outcome: &'static str) {
    counter!("log_beacon_ingest_total", "outcome" => outcome).increment(1);
}

/// Record a consumer decision
pub fn record_consumer_message(consumer: &'static str, outcome: &'static str) {
    counter!(
        "log_beacon_consumer_messages_total",
        "consumer" => consumer,
        "outcome" => outcome,
    )
    .increment(1);
}

pub fn record_search(outcome: &'static str, duration: Duration) {
    counter!("log_beacon_search_requests_total", "outcome" => outcome).increment(1);
    histogram!("log_beacon_search_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_tail_drops(count: u64) {
    if count > 0 {
        counter!("log_beacon_tail_dropped_total").increment(count);
    }
}

pub fn tail_session_opened() {
    gauge!("log_beacon_tail_sessions").increment(1.0);
}

pub fn tail_session_closed() {
    gauge!("log_beacon_tail_sessions").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        init_metric_descriptions();

        record_ingest("accepted");
        record_consumer_message("archiver", "archived");
        record_search("success", Duration::from_millis(12));
        record_tail_drops(2);
        tail_session_opened();
        tail_session_closed();

        // No recorder installed: calls must be no-ops, not panics
    }
}
