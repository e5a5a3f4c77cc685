//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for the realtime gateway:
//! - Handshake outcomes (accepted, rejected by reason)
//! - Open connections and message traffic
//! - Throttled messages and swallowed broadcast failures
//! - Latency percentiles, alerts and process resources from the performance monitor
//! - Per-tenant quality scores

use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the realtime gateway
#[derive(Clone)]
pub struct Metrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Handshake metrics
    /// Handshake attempts by outcome (accepted, rejected)
    pub auth_attempts_total: IntCounterVec,
    /// Rejected handshakes by internal reason code
    pub auth_rejections_total: IntCounterVec,
    /// IPs banned by abuse detection or manually
    pub ip_bans_total: IntCounter,

    // Connection metrics
    /// Currently open WebSocket connections
    pub active_connections: IntGauge,
    /// Messages by direction (inbound, outbound) and kind
    pub messages_total: IntCounterVec,
    /// Bytes by direction
    pub message_bytes_total: CounterVec,
    /// Inbound message handling latency
    pub message_duration_seconds: HistogramVec,
    /// Messages refused by the per-connection rate limit
    pub throttled_messages_total: IntCounter,
    /// Broadcasts that failed after a successful write
    pub broadcast_failures_total: IntCounter,

    // Performance monitor
    /// Latency percentiles across connections (quantile = p50, p95, p99)
    pub latency_percentile_ms: GaugeVec,
    /// Messages per second over the last sampling interval
    pub throughput_messages_per_second: Gauge,
    /// Alerts raised by kind and severity
    pub alerts_total: IntCounterVec,
    /// Resident memory of this process
    pub process_memory_bytes: Gauge,
    /// CPU usage of this process in percent
    pub process_cpu_percent: Gauge,
    /// Composite quality score per tenant (0-100)
    pub tenant_quality_score: GaugeVec,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let auth_attempts_total = IntCounterVec::new(
            Opts::new(
                "pulsegrid_auth_attempts_total",
                "Total number of WebSocket handshake attempts",
            ),
            &["outcome"],
        )?;

        let auth_rejections_total = IntCounterVec::new(
            Opts::new(
                "pulsegrid_auth_rejections_total",
                "Total number of rejected handshakes by reason",
            ),
            &["reason"],
        )?;

        let ip_bans_total = IntCounter::new(
            "pulsegrid_ip_bans_total",
            "Total number of IP bans imposed",
        )?;

        let active_connections = IntGauge::new(
            "pulsegrid_active_connections",
            "Number of open WebSocket connections",
        )?;

        let messages_total = IntCounterVec::new(
            Opts::new("pulsegrid_messages_total", "Total number of WebSocket messages"),
            &["direction", "kind"],
        )?;

        let message_bytes_total = CounterVec::new(
            Opts::new(
                "pulsegrid_message_bytes_total",
                "Total WebSocket payload bytes",
            ),
            &["direction"],
        )?;

        let message_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pulsegrid_message_duration_seconds",
                "Inbound message handling duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ]),
            &["kind"],
        )?;

        let throttled_messages_total = IntCounter::new(
            "pulsegrid_throttled_messages_total",
            "Total number of messages refused by the per-connection rate limit",
        )?;

        let broadcast_failures_total = IntCounter::new(
            "pulsegrid_broadcast_failures_total",
            "Total number of broadcasts that failed after a successful write",
        )?;

        let latency_percentile_ms = GaugeVec::new(
            Opts::new(
                "pulsegrid_latency_percentile_ms",
                "Latency percentiles across connections in milliseconds",
            ),
            &["quantile"],
        )?;

        let throughput_messages_per_second = Gauge::new(
            "pulsegrid_throughput_messages_per_second",
            "Messages per second over the last sampling interval",
        )?;

        let alerts_total = IntCounterVec::new(
            Opts::new("pulsegrid_alerts_total", "Total number of performance alerts"),
            &["kind", "severity"],
        )?;

        let process_memory_bytes = Gauge::new(
            "pulsegrid_process_memory_bytes",
            "Resident memory of the gateway process",
        )?;

        let process_cpu_percent = Gauge::new(
            "pulsegrid_process_cpu_percent",
            "CPU usage of the gateway process",
        )?;

        let tenant_quality_score = GaugeVec::new(
            Opts::new(
                "pulsegrid_tenant_quality_score",
                "Composite connection quality score per tenant (0-100)",
            ),
            &["tenant"],
        )?;

        registry.register(Box::new(auth_attempts_total.clone()))?;
        registry.register(Box::new(auth_rejections_total.clone()))?;
        registry.register(Box::new(ip_bans_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(message_bytes_total.clone()))?;
        registry.register(Box::new(message_duration_seconds.clone()))?;
        registry.register(Box::new(throttled_messages_total.clone()))?;
        registry.register(Box::new(broadcast_failures_total.clone()))?;
        registry.register(Box::new(latency_percentile_ms.clone()))?;
        registry.register(Box::new(throughput_messages_per_second.clone()))?;
        registry.register(Box::new(alerts_total.clone()))?;
        registry.register(Box::new(process_memory_bytes.clone()))?;
        registry.register(Box::new(process_cpu_percent.clone()))?;
        registry.register(Box::new(tenant_quality_score.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            auth_attempts_total,
            auth_rejections_total,
            ip_bans_total,
            active_connections,
            messages_total,
            message_bytes_total,
            message_duration_seconds,
            throttled_messages_total,
            broadcast_failures_total,
            latency_percentile_ms,
            throughput_messages_per_second,
            alerts_total,
            process_memory_bytes,
            process_cpu_percent,
            tenant_quality_score,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an accepted handshake
    pub fn record_auth_success(&self) {
        self.auth_attempts_total.with_label_values(&["accepted"]).inc();
    }

    /// Record a rejected handshake with its internal reason code
    pub fn record_auth_rejection(&self, reason: &str) {
        self.auth_attempts_total.with_label_values(&["rejected"]).inc();
        self.auth_rejections_total.with_label_values(&[reason]).inc();
    }

    pub fn record_ip_ban(&self) {
        self.ip_bans_total.inc();
    }

    pub fn connection_opened(&self) {
        self.active_connections.inc();
    }

    pub fn connection_closed(&self) {
        self.active_connections.dec();
    }

    /// Record an inbound message and how long it took to handle
    pub fn record_inbound(&self, kind: &str, bytes: usize, duration_secs: f64) {
        self.messages_total.with_label_values(&["inbound", kind]).inc();
        self.message_bytes_total
            .with_label_values(&["inbound"])
            .inc_by(bytes as f64);
        self.message_duration_seconds
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    /// Record an outbound message
    pub fn record_outbound(&self, kind: &str, bytes: usize) {
        self.messages_total.with_label_values(&["outbound", kind]).inc();
        self.message_bytes_total
            .with_label_values(&["outbound"])
            .inc_by(bytes as f64);
    }

    pub fn record_throttled(&self) {
        self.throttled_messages_total.inc();
    }

    pub fn record_broadcast_failure(&self) {
        self.broadcast_failures_total.inc();
    }

    /// Publish the latest percentile and throughput sample
    pub fn update_latency(&self, p50: f64, p95: f64, p99: f64, messages_per_second: f64) {
        self.latency_percentile_ms.with_label_values(&["p50"]).set(p50);
        self.latency_percentile_ms.with_label_values(&["p95"]).set(p95);
        self.latency_percentile_ms.with_label_values(&["p99"]).set(p99);
        self.throughput_messages_per_second.set(messages_per_second);
    }

    pub fn record_alert(&self, kind: &str, severity: &str) {
        self.alerts_total.with_label_values(&[kind, severity]).inc();
    }

    pub fn update_process(&self, memory_bytes: u64, cpu_percent: f64) {
        self.process_memory_bytes.set(memory_bytes as f64);
        self.process_cpu_percent.set(cpu_percent);
    }

    pub fn set_tenant_quality(&self, tenant: &str, score: f64) {
        self.tenant_quality_score.with_label_values(&[tenant]).set(score);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_auth_outcomes() {
        let metrics = Metrics::new().unwrap();
        metrics.record_auth_success();
        metrics.record_auth_rejection("IP_BANNED");
        metrics.record_auth_rejection("IP_BANNED");
        metrics.record_auth_rejection("NO_TOKEN");

        assert_eq!(
            metrics.auth_attempts_total.with_label_values(&["accepted"]).get(),
            1
        );
        assert_eq!(
            metrics.auth_attempts_total.with_label_values(&["rejected"]).get(),
            3
        );
        assert_eq!(
            metrics
                .auth_rejections_total
                .with_label_values(&["IP_BANNED"])
                .get(),
            2
        );
    }

    #[test]
    fn test_connection_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections.get(), 1);
    }

    #[test]
    fn test_traffic_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.record_inbound("publish", 120, 0.004);
        metrics.record_outbound("event", 200);
        metrics.record_throttled();
        metrics.record_broadcast_failure();

        assert_eq!(
            metrics
                .messages_total
                .with_label_values(&["inbound", "publish"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .message_bytes_total
                .with_label_values(&["outbound"])
                .get(),
            200.0
        );
        assert_eq!(metrics.throttled_messages_total.get(), 1);
        assert_eq!(metrics.broadcast_failures_total.get(), 1);
    }

    #[test]
    fn test_monitor_gauges() {
        let metrics = Metrics::new().unwrap();
        metrics.update_latency(10.0, 50.0, 90.0, 12.5);
        metrics.update_process(1024, 3.5);
        metrics.set_tenant_quality("t1", 97.0);
        metrics.record_alert("latency", "critical");

        assert_eq!(
            metrics.latency_percentile_ms.with_label_values(&["p95"]).get(),
            50.0
        );
        assert_eq!(metrics.throughput_messages_per_second.get(), 12.5);
        assert_eq!(metrics.process_memory_bytes.get(), 1024.0);
        assert_eq!(
            metrics.tenant_quality_score.with_label_values(&["t1"]).get(),
            97.0
        );
        assert_eq!(
            metrics
                .alerts_total
                .with_label_values(&["latency", "critical"])
                .get(),
            1
        );
    }
}
