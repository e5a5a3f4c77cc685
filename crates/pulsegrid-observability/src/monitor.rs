//! Connection performance monitoring
//!
//! `PerformanceMonitor` keeps per-connection latency rings and traffic
//! counters, and on every sampling cycle:
//! - computes p50/p95/p99 over the per-connection rolling averages
//! - derives throughput and error rate from counter deltas
//! - reads process memory and CPU through a `ResourceProbe`
//! - appends to bounded histories, establishes a baseline and tracks the
//!   latency trend
//! - checks each threshold independently and keeps a capped alert list
//!
//! All state is in-process and is lost on restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulsegrid_core::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::Metrics;

/// Values above which an alert is raised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub latency_p95_ms: f64,
    pub throughput_messages_per_sec: f64,
    pub memory_bytes: u64,
    pub error_rate: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            latency_p95_ms: 250.0,
            throughput_messages_per_sec: 5_000.0,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            error_rate: 0.05,
        }
    }
}

/// Configuration for the performance monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often `spawn_monitor_task` samples
    #[serde(with = "duration_secs")]
    pub sampling_interval: Duration,
    /// A connection with activity inside this window counts as active
    #[serde(with = "duration_secs")]
    pub active_window: Duration,
    /// Points kept per history ring
    pub history_capacity: usize,
    /// Latency samples kept per connection
    pub latency_samples_per_connection: usize,
    /// Samples needed before the baseline is fixed
    pub baseline_samples: usize,
    /// Samples used for the latency trend slope
    pub trend_window: usize,
    /// Milliseconds per sample of p95 growth that raise a trend alert
    pub trend_slope_threshold: f64,
    #[serde(with = "duration_secs")]
    pub alert_retention: Duration,
    pub max_alerts: usize,
    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sampling_interval: Duration::from_secs(5),
            active_window: Duration::from_secs(30),
            history_capacity: 360,
            latency_samples_per_connection: 100,
            baseline_samples: 10,
            trend_window: 10,
            trend_slope_threshold: 5.0,
            alert_retention: Duration::from_secs(3600),
            max_alerts: 100,
            thresholds: AlertThresholds::default(),
        }
    }
}

impl MonitorConfig {
    pub fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    pub fn with_thresholds(mut self, thresholds: AlertThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity.max(1);
        self
    }

    pub fn with_max_alerts(mut self, max_alerts: usize) -> Self {
        self.max_alerts = max_alerts;
        self
    }
}

/// Durations in config files are whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub messages_per_sec: f64,
    pub bytes_per_sec: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f64,
}

/// Operations and failures counted over one interval or one tenant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCounts {
    pub operations: u64,
    pub connection: u64,
    pub data: u64,
}

impl ErrorCounts {
    pub fn total(&self) -> u64 {
        self.connection + self.data
    }

    fn ratio(&self, errors: u64) -> f64 {
        if self.operations == 0 {
            0.0
        } else {
            (errors as f64 / self.operations as f64).min(1.0)
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.ratio(self.total())
    }

    pub fn connection_stability(&self) -> f64 {
        1.0 - self.ratio(self.connection)
    }

    pub fn data_integrity(&self) -> f64 {
        1.0 - self.ratio(self.data)
    }

    /// Mean of stability and integrity on a 0-100 scale
    pub fn quality_score(&self) -> f64 {
        (self.connection_stability() + self.data_integrity()) / 2.0 * 100.0
    }
}

/// One sampling cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub latency: LatencyPercentiles,
    pub throughput: Throughput,
    pub resources: ResourceUsage,
    pub success_rate: f64,
    pub error_rate: f64,
    /// Failures since the previous sample
    pub errors: ErrorCounts,
    pub quality_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Latency,
    Throughput,
    Memory,
    ErrorRate,
    LatencyTrend,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Latency => "latency",
            AlertKind::Throughput => "throughput",
            AlertKind::Memory => "memory",
            AlertKind::ErrorRate => "error_rate",
            AlertKind::LatencyTrend => "latency_trend",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Averages over the first `baseline_samples` cycles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub latency_p95_ms: f64,
    pub throughput_messages_per_sec: f64,
    pub error_rate: f64,
    pub established_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceHistory {
    pub latency_p95_ms: Vec<HistoryPoint>,
    pub throughput_messages_per_sec: Vec<HistoryPoint>,
    pub error_rate: Vec<HistoryPoint>,
}

/// Per-tenant rollup of the connections it currently holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantPerformance {
    pub tenant_id: TenantId,
    pub connections: usize,
    pub avg_latency_ms: f64,
    /// Sum of per-connection message rates over each connection's lifetime
    pub estimated_throughput: f64,
    pub error_rate: f64,
    pub connection_stability: f64,
    pub data_integrity: f64,
    /// Mean of stability and integrity, scaled to 0-100
    pub quality_score: f64,
}

/// Which sub-score a failed operation counts against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport or protocol failure on the socket
    Connection,
    /// Rejected or failed read/write of tenant data
    Data,
}

/// Source of process resource readings
pub trait ResourceProbe: Send + Sync {
    fn sample(&self) -> ResourceUsage;
}

/// Reads this process's memory and CPU through `sysinfo`
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            warn!("Could not determine current pid; resource readings disabled");
        }
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn sample(&self) -> ResourceUsage {
        let Some(pid) = self.pid else {
            return ResourceUsage::default();
        };
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| ResourceUsage {
                memory_bytes: process.memory(),
                cpu_percent: process.cpu_usage() as f64,
            })
            .unwrap_or_default()
    }
}

/// Percentile of an ascending slice with linear interpolation between ranks
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        len => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (len - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

/// Least-squares slope of evenly spaced values
pub fn trend_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean_x = (n - 1) as f64 / 2.0;
    let mean_y = values.iter().sum::<f64>() / n as f64;
    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

/// Alert for a value strictly above its threshold; critical beyond twice the threshold
pub fn check_threshold(
    kind: AlertKind,
    value: f64,
    threshold: f64,
    now: DateTime<Utc>,
) -> Option<Alert> {
    if value <= threshold {
        return None;
    }
    let severity = if value > threshold * 2.0 {
        AlertSeverity::Critical
    } else {
        AlertSeverity::Warning
    };
    Some(Alert {
        id: Uuid::new_v4(),
        kind,
        severity,
        value,
        threshold,
        message: format!(
            "{} {:.2} exceeds threshold {:.2}",
            kind.as_str(),
            value,
            threshold
        ),
        raised_at: now,
    })
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug)]
struct ConnectionStats {
    tenant_id: TenantId,
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    latencies_ms: VecDeque<f64>,
    messages: u64,
    operations: u64,
    connection_errors: u64,
    data_errors: u64,
}

impl ConnectionStats {
    fn average_latency(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            None
        } else {
            Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    latency_history: VecDeque<HistoryPoint>,
    throughput_history: VecDeque<HistoryPoint>,
    error_history: VecDeque<HistoryPoint>,
    samples_taken: usize,
    baseline: Option<Baseline>,
    trend: Option<f64>,
    alerts: VecDeque<Alert>,
    last_sample_at: Option<DateTime<Utc>>,
    last_messages: u64,
    last_bytes: u64,
    last_operations: u64,
    last_connection_errors: u64,
    last_data_errors: u64,
    latest: Option<PerformanceSnapshot>,
}

fn push_bounded<T>(ring: &mut VecDeque<T>, value: T, capacity: usize) {
    ring.push_back(value);
    while ring.len() > capacity {
        ring.pop_front();
    }
}

/// Samples connection performance and raises alerts
pub struct PerformanceMonitor {
    config: MonitorConfig,
    connections: DashMap<String, ConnectionStats>,
    state: Mutex<MonitorState>,
    messages_total: AtomicU64,
    bytes_total: AtomicU64,
    operations_total: AtomicU64,
    connection_errors_total: AtomicU64,
    data_errors_total: AtomicU64,
    probe: Arc<dyn ResourceProbe>,
    metrics: Option<Arc<Metrics>>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            state: Mutex::new(MonitorState::default()),
            messages_total: AtomicU64::new(0),
            bytes_total: AtomicU64::new(0),
            operations_total: AtomicU64::new(0),
            connection_errors_total: AtomicU64::new(0),
            data_errors_total: AtomicU64::new(0),
            probe: Arc::new(SysinfoProbe::new()),
            metrics: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_connection(&self, connection_id: &str, tenant_id: TenantId) {
        self.register_connection_at(connection_id, tenant_id, Utc::now());
    }

    pub fn register_connection_at(
        &self,
        connection_id: &str,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) {
        debug!(connection_id, %tenant_id, "Tracking connection");
        self.connections.insert(
            connection_id.to_string(),
            ConnectionStats {
                tenant_id,
                connected_at: now,
                last_activity: now,
                latencies_ms: VecDeque::with_capacity(self.config.latency_samples_per_connection),
                messages: 0,
                operations: 0,
                connection_errors: 0,
                data_errors: 0,
            },
        );
    }

    pub fn unregister_connection(&self, connection_id: &str) {
        if self.connections.remove(connection_id).is_some() {
            debug!(connection_id, "Stopped tracking connection");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Record one successfully handled message
    pub fn record_message(&self, connection_id: &str, latency: Duration, bytes: usize) {
        self.record_message_at(connection_id, latency, bytes, Utc::now());
    }

    pub fn record_message_at(
        &self,
        connection_id: &str,
        latency: Duration,
        bytes: usize,
        now: DateTime<Utc>,
    ) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        self.bytes_total.fetch_add(bytes as u64, Ordering::Relaxed);
        self.operations_total.fetch_add(1, Ordering::Relaxed);

        if let Some(mut stats) = self.connections.get_mut(connection_id) {
            push_bounded(
                &mut stats.latencies_ms,
                latency.as_secs_f64() * 1000.0,
                self.config.latency_samples_per_connection.max(1),
            );
            stats.messages += 1;
            stats.operations += 1;
            stats.last_activity = now;
        }
    }

    /// Record one failed operation
    pub fn record_error(&self, connection_id: &str, class: ErrorClass) {
        self.operations_total.fetch_add(1, Ordering::Relaxed);
        match class {
            ErrorClass::Connection => self.connection_errors_total.fetch_add(1, Ordering::Relaxed),
            ErrorClass::Data => self.data_errors_total.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(mut stats) = self.connections.get_mut(connection_id) {
            stats.operations += 1;
            match class {
                ErrorClass::Connection => stats.connection_errors += 1,
                ErrorClass::Data => stats.data_errors += 1,
            }
        }
    }

    pub fn sample(&self) -> PerformanceSnapshot {
        self.sample_at(Utc::now())
    }

    /// Run one sampling cycle
    pub fn sample_at(&self, now: DateTime<Utc>) -> PerformanceSnapshot {
        let active_since = now - chrono_duration(self.config.active_window);
        let mut averages = Vec::with_capacity(self.connections.len());
        let mut total = 0;
        let mut active = 0;
        for entry in self.connections.iter() {
            total += 1;
            if entry.last_activity >= active_since {
                active += 1;
            }
            if let Some(avg) = entry.average_latency() {
                averages.push(avg);
            }
        }
        averages.sort_by(|a, b| a.total_cmp(b));
        let latency = LatencyPercentiles {
            p50: percentile(&averages, 50.0),
            p95: percentile(&averages, 95.0),
            p99: percentile(&averages, 99.0),
        };

        let messages = self.messages_total.load(Ordering::Relaxed);
        let bytes = self.bytes_total.load(Ordering::Relaxed);
        let operations = self.operations_total.load(Ordering::Relaxed);
        let connection_errors = self.connection_errors_total.load(Ordering::Relaxed);
        let data_errors = self.data_errors_total.load(Ordering::Relaxed);
        let resources = self.probe.sample();

        let mut state = self.state();
        let elapsed = state
            .last_sample_at
            .map(|last| (now - last).num_milliseconds() as f64 / 1000.0)
            .filter(|secs| *secs > 0.0)
            .unwrap_or_else(|| self.config.sampling_interval.as_secs_f64().max(1.0));

        let throughput = Throughput {
            messages_per_sec: messages.saturating_sub(state.last_messages) as f64 / elapsed,
            bytes_per_sec: bytes.saturating_sub(state.last_bytes) as f64 / elapsed,
        };
        let errors = ErrorCounts {
            operations: operations.saturating_sub(state.last_operations),
            connection: connection_errors.saturating_sub(state.last_connection_errors),
            data: data_errors.saturating_sub(state.last_data_errors),
        };
        let error_rate = errors.error_rate();

        let snapshot = PerformanceSnapshot {
            timestamp: now,
            total_connections: total,
            active_connections: active,
            idle_connections: total - active,
            latency,
            throughput,
            resources,
            success_rate: 1.0 - error_rate,
            error_rate,
            errors,
            quality_score: errors.quality_score(),
        };

        state.last_sample_at = Some(now);
        state.last_messages = messages;
        state.last_bytes = bytes;
        state.last_operations = operations;
        state.last_connection_errors = connection_errors;
        state.last_data_errors = data_errors;
        state.samples_taken += 1;

        let capacity = self.config.history_capacity.max(1);
        push_bounded(
            &mut state.latency_history,
            HistoryPoint { timestamp: now, value: latency.p95 },
            capacity,
        );
        push_bounded(
            &mut state.throughput_history,
            HistoryPoint { timestamp: now, value: throughput.messages_per_sec },
            capacity,
        );
        push_bounded(
            &mut state.error_history,
            HistoryPoint { timestamp: now, value: error_rate },
            capacity,
        );

        if state.baseline.is_none() && state.samples_taken >= self.config.baseline_samples {
            let n = state.latency_history.len().min(self.config.baseline_samples).max(1);
            let mean = |ring: &VecDeque<HistoryPoint>| {
                ring.iter().rev().take(n).map(|p| p.value).sum::<f64>() / n as f64
            };
            let baseline = Baseline {
                latency_p95_ms: mean(&state.latency_history),
                throughput_messages_per_sec: mean(&state.throughput_history),
                error_rate: mean(&state.error_history),
                established_at: now,
            };
            info!(
                latency_p95_ms = baseline.latency_p95_ms,
                throughput = baseline.throughput_messages_per_sec,
                "Performance baseline established"
            );
            state.baseline = Some(baseline);
        }

        let mut raised = Vec::new();
        let thresholds = &self.config.thresholds;
        raised.extend(check_threshold(
            AlertKind::Latency,
            latency.p95,
            thresholds.latency_p95_ms,
            now,
        ));
        raised.extend(check_threshold(
            AlertKind::Throughput,
            throughput.messages_per_sec,
            thresholds.throughput_messages_per_sec,
            now,
        ));
        raised.extend(check_threshold(
            AlertKind::Memory,
            resources.memory_bytes as f64,
            thresholds.memory_bytes as f64,
            now,
        ));
        raised.extend(check_threshold(
            AlertKind::ErrorRate,
            error_rate,
            thresholds.error_rate,
            now,
        ));

        let window = self.config.trend_window;
        if window >= 2 && state.latency_history.len() >= window {
            let recent: Vec<f64> = state
                .latency_history
                .iter()
                .skip(state.latency_history.len() - window)
                .map(|p| p.value)
                .collect();
            let slope = trend_slope(&recent);
            state.trend = Some(slope);
            if state.baseline.is_some() {
                raised.extend(check_threshold(
                    AlertKind::LatencyTrend,
                    slope,
                    self.config.trend_slope_threshold,
                    now,
                ));
            }
        }

        for alert in &raised {
            warn!(
                kind = alert.kind.as_str(),
                severity = alert.severity.as_str(),
                value = alert.value,
                threshold = alert.threshold,
                "Performance alert"
            );
            state.alerts.push_back(alert.clone());
        }
        let retain_after = now - chrono_duration(self.config.alert_retention);
        state.alerts.retain(|a| a.raised_at >= retain_after);
        while state.alerts.len() > self.config.max_alerts {
            state.alerts.pop_front();
        }

        state.latest = Some(snapshot.clone());
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.update_latency(
                latency.p50,
                latency.p95,
                latency.p99,
                throughput.messages_per_sec,
            );
            metrics.update_process(resources.memory_bytes, resources.cpu_percent);
            for alert in &raised {
                metrics.record_alert(alert.kind.as_str(), alert.severity.as_str());
            }
            for rollup in self.tenant_rollups_at(now) {
                metrics.set_tenant_quality(&rollup.tenant_id.to_string(), rollup.quality_score);
            }
        }

        snapshot
    }

    pub fn latest_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.state().latest.clone()
    }

    pub fn baseline(&self) -> Option<Baseline> {
        self.state().baseline
    }

    /// Latest p95 slope in milliseconds per sample
    pub fn trend(&self) -> Option<f64> {
        self.state().trend
    }

    /// Retained alerts, oldest first
    pub fn alerts(&self) -> Vec<Alert> {
        self.state().alerts.iter().cloned().collect()
    }

    pub fn history(&self) -> PerformanceHistory {
        let state = self.state();
        PerformanceHistory {
            latency_p95_ms: state.latency_history.iter().copied().collect(),
            throughput_messages_per_sec: state.throughput_history.iter().copied().collect(),
            error_rate: state.error_history.iter().copied().collect(),
        }
    }

    pub fn tenant_rollup(&self, tenant_id: TenantId) -> Option<TenantPerformance> {
        self.tenant_rollup_at(tenant_id, Utc::now())
    }

    pub fn tenant_rollup_at(
        &self,
        tenant_id: TenantId,
        now: DateTime<Utc>,
    ) -> Option<TenantPerformance> {
        let mut connections = 0;
        let mut latency_sum = 0.0;
        let mut latency_count = 0;
        let mut throughput = 0.0;
        let mut counts = ErrorCounts::default();

        for entry in self.connections.iter().filter(|e| e.tenant_id == tenant_id) {
            connections += 1;
            if let Some(avg) = entry.average_latency() {
                latency_sum += avg;
                latency_count += 1;
            }
            let age = ((now - entry.connected_at).num_milliseconds() as f64 / 1000.0).max(1.0);
            throughput += entry.messages as f64 / age;
            counts.operations += entry.operations;
            counts.connection += entry.connection_errors;
            counts.data += entry.data_errors;
        }

        if connections == 0 {
            return None;
        }

        Some(TenantPerformance {
            tenant_id,
            connections,
            avg_latency_ms: if latency_count == 0 {
                0.0
            } else {
                latency_sum / latency_count as f64
            },
            estimated_throughput: throughput,
            error_rate: counts.error_rate(),
            connection_stability: counts.connection_stability(),
            data_integrity: counts.data_integrity(),
            quality_score: counts.quality_score(),
        })
    }

    /// Rollups for every tenant with an open connection
    pub fn tenant_rollups(&self) -> Vec<TenantPerformance> {
        self.tenant_rollups_at(Utc::now())
    }

    fn tenant_rollups_at(&self, now: DateTime<Utc>) -> Vec<TenantPerformance> {
        let mut tenants: Vec<TenantId> = self.connections.iter().map(|e| e.tenant_id).collect();
        tenants.sort();
        tenants.dedup();
        tenants
            .into_iter()
            .filter_map(|t| self.tenant_rollup_at(t, now))
            .collect()
    }
}

/// Handle for the background sampling task
pub struct MonitorTask {
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

impl MonitorTask {
    /// Signal the sampling task to shut down
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Spawn a task that samples on the configured interval
pub fn spawn_monitor_task(monitor: Arc<PerformanceMonitor>) -> MonitorTask {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let interval = monitor.config.sampling_interval;
        info!(
            interval_secs = interval.as_secs(),
            "Starting performance monitor"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Performance monitor shutting down");
                    break;
                }
                _ = sleep(interval) => {
                    let snapshot = monitor.sample();
                    debug!(
                        connections = snapshot.total_connections,
                        p95_ms = snapshot.latency.p95,
                        "Performance sample"
                    );
                }
            }
        }
    });

    MonitorTask { shutdown_tx }
}
