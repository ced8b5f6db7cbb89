//! Prometheus text exposition for monitor metrics
//!
//! Served at `/metrics` by the control-plane HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; METRICS_NUM_BUCKETS - 1],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// (name, help, type, value) rows written in order
type MetricRow = (&'static str, &'static str, MetricType, u64);

fn write_rows(output: &mut String, site: &str, rows: Vec<MetricRow>) {
    for (name, help, typ, val) in rows {
        write_metric(output, name, help, typ, site, val);
    }
}

/// Format metrics in Prometheus text exposition format
pub fn format_prometheus_metrics(
    metrics: &Metrics,
    tracked_devices: usize,
    connected_devices: usize,
    monitoring: bool,
    site_id: &str,
) -> String {
    let summary = metrics.report(tracked_devices, connected_devices);
    let mut output = String::with_capacity(4096);

    write_rows(&mut output, site_id, poll_rows(&summary));
    write_histogram(
        &mut output,
        "presence_poll_latency_ms",
        "Poll cycle latency in milliseconds",
        site_id,
        &summary.poll_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.poll_lat_avg_ms,
    );
    write_rows(&mut output, site_id, presence_rows(&summary, monitoring));
    write_rows(&mut output, site_id, gate_rows(&summary));

    output
}

fn poll_rows(s: &MetricsSummary) -> Vec<MetricRow> {
    use MetricType::{Counter, Gauge};
    vec![
        ("presence_polls_total", "Completed poll cycles", Counter, s.polls_total),
        (
            "presence_poll_failures_total",
            "Poll cycles skipped because the snapshot could not be fetched",
            Counter,
            s.poll_failures_total,
        ),
        (
            "presence_poll_latency_max_ms",
            "Maximum poll cycle latency since last scrape",
            Gauge,
            s.poll_lat_max_ms,
        ),
        (
            "presence_auth_failures_total",
            "Failed controller re-authentications",
            Counter,
            s.auth_failures_total,
        ),
        (
            "presence_auth_successes_total",
            "Successful controller re-authentications",
            Counter,
            s.auth_successes_total,
        ),
        (
            "presence_auth_backoff_skips_total",
            "Poll cycles skipped during re-authentication backoff",
            Counter,
            s.auth_backoff_skips_total,
        ),
    ]
}

fn presence_rows(s: &MetricsSummary, monitoring: bool) -> Vec<MetricRow> {
    use MetricType::{Counter, Gauge};
    vec![
        ("presence_monitoring", "Whether monitoring is active (0/1)", Gauge, u64::from(monitoring)),
        ("presence_tracked_devices", "Devices currently tracked", Gauge, s.tracked_devices as u64),
        (
            "presence_connected_devices",
            "Tracked devices currently connected",
            Gauge,
            s.connected_devices as u64,
        ),
        ("presence_connects_total", "Connect transitions", Counter, s.connects_total),
        ("presence_disconnects_total", "Disconnect transitions", Counter, s.disconnects_total),
        ("presence_roams_total", "Roam transitions", Counter, s.roams_total),
    ]
}

fn gate_rows(s: &MetricsSummary) -> Vec<MetricRow> {
    use MetricType::Counter;
    vec![
        ("presence_gate_triggers_total", "Successful gate triggers", Counter, s.gate_triggers_total),
        ("presence_gate_skips_total", "Gate triggers skipped by cooldown", Counter, s.gate_skips_total),
        ("presence_gate_errors_total", "Failed gate triggers", Counter, s.gate_errors_total),
        (
            "presence_log_write_failures_total",
            "Activity log writes that failed",
            Counter,
            s.log_write_failures_total,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_poll(15);
        metrics.record_poll(250);
        metrics.record_gate_trigger();
        metrics.record_gate_skip();

        let output = format_prometheus_metrics(&metrics, 3, 1, true, "default");

        assert!(output.contains("presence_polls_total{site=\"default\"} 2"));
        assert!(output.contains("presence_poll_latency_ms_bucket{site=\"default\",le=\"20\"} 1"));
        assert!(output.contains("presence_poll_latency_ms_bucket{site=\"default\",le=\"+Inf\"} 2"));
        assert!(output.contains("presence_gate_triggers_total{site=\"default\"} 1"));
        assert!(output.contains("presence_gate_skips_total{site=\"default\"} 1"));
        assert!(output.contains("presence_tracked_devices{site=\"default\"} 3"));
        assert!(output.contains("presence_connected_devices{site=\"default\"} 1"));
        assert!(output.contains("presence_monitoring{site=\"default\"} 1"));
    }
}
