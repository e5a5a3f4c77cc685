//! Metrics for the PostgreSQL store
//!
//! Provides Prometheus metrics for monitoring the storage layer:
//! - Event writes (count, errors, latency)
//! - Tenant-scoped queries (count by status, latency)
//! - Connection pool occupancy and acquisition latency
//! - Migration and partition maintenance

use prometheus::{
    CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, Opts,
    Registry,
};
use std::sync::Arc;

/// Metrics collector for the PostgreSQL store
#[derive(Clone)]
pub struct StoreMetrics {
    registry: Arc<Registry>,

    // Event writes
    pub events_written_total: CounterVec,
    pub event_write_errors_total: CounterVec,
    pub event_write_duration_seconds: Histogram,

    // Queries
    pub queries_total: CounterVec,
    pub query_duration_seconds: HistogramVec,

    // Connection pool
    pub pool_connections_total: Gauge,
    pub pool_connections_idle: Gauge,
    pub pool_connections_active: Gauge,
    pub pool_acquire_duration_seconds: Histogram,

    // Migrations
    pub migrations_applied_total: Gauge,
    pub migration_duration_seconds: HistogramVec,

    // Partitions and TimescaleDB
    pub partitions_created_total: IntCounter,
    pub partitions_dropped_total: IntCounter,
    pub timescaledb_enabled: GaugeVec,
}

impl StoreMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let events_written_total = CounterVec::new(
            Opts::new(
                "pulsegrid_store_events_written_total",
                "Total number of activity events written",
            ),
            &["event_type"],
        )?;

        let event_write_errors_total = CounterVec::new(
            Opts::new(
                "pulsegrid_store_event_write_errors_total",
                "Total number of activity event write errors",
            ),
            &["error_type"],
        )?;

        let event_write_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pulsegrid_store_event_write_duration_seconds",
                "Event write duration in seconds",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25,
            ]),
        )?;

        let queries_total = CounterVec::new(
            Opts::new(
                "pulsegrid_store_queries_total",
                "Total number of tenant-scoped queries",
            ),
            &["operation", "status"],
        )?;

        let query_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pulsegrid_store_query_duration_seconds",
                "Query duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
            &["operation"],
        )?;

        let pool_connections_total = Gauge::with_opts(Opts::new(
            "pulsegrid_store_pool_connections_total",
            "Pooled connections, idle or in use",
        ))?;

        let pool_connections_idle = Gauge::with_opts(Opts::new(
            "pulsegrid_store_pool_connections_idle",
            "Pooled connections currently idle",
        ))?;

        let pool_connections_active = Gauge::with_opts(Opts::new(
            "pulsegrid_store_pool_connections_active",
            "Number of connections in use",
        ))?;

        let pool_acquire_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pulsegrid_store_pool_acquire_duration_seconds",
                "Time spent waiting for a pooled connection, in seconds",
            )
            .buckets(vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
            ]),
        )?;

        let migrations_applied_total = Gauge::with_opts(Opts::new(
            "pulsegrid_store_migrations_applied_total",
            "Number of applied schema migrations",
        ))?;

        let migration_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pulsegrid_store_migration_duration_seconds",
                "Wall time of each applied migration, in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
            &["version"],
        )?;

        let partitions_created_total = IntCounter::with_opts(Opts::new(
            "pulsegrid_store_partitions_created_total",
            "Total number of partitions created",
        ))?;

        let partitions_dropped_total = IntCounter::with_opts(Opts::new(
            "pulsegrid_store_partitions_dropped_total",
            "Total number of partitions dropped by retention",
        ))?;

        let timescaledb_enabled = GaugeVec::new(
            Opts::new(
                "pulsegrid_store_timescaledb_enabled",
                "Whether the TimescaleDB extension is available (1=yes, 0=no)",
            ),
            &["database"],
        )?;

        registry.register(Box::new(events_written_total.clone()))?;
        registry.register(Box::new(event_write_errors_total.clone()))?;
        registry.register(Box::new(event_write_duration_seconds.clone()))?;
        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration_seconds.clone()))?;
        registry.register(Box::new(pool_connections_total.clone()))?;
        registry.register(Box::new(pool_connections_idle.clone()))?;
        registry.register(Box::new(pool_connections_active.clone()))?;
        registry.register(Box::new(pool_acquire_duration_seconds.clone()))?;
        registry.register(Box::new(migrations_applied_total.clone()))?;
        registry.register(Box::new(migration_duration_seconds.clone()))?;
        registry.register(Box::new(partitions_created_total.clone()))?;
        registry.register(Box::new(partitions_dropped_total.clone()))?;
        registry.register(Box::new(timescaledb_enabled.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            events_written_total,
            event_write_errors_total,
            event_write_duration_seconds,
            queries_total,
            query_duration_seconds,
            pool_connections_total,
            pool_connections_idle,
            pool_connections_active,
            pool_acquire_duration_seconds,
            migrations_applied_total,
            migration_duration_seconds,
            partitions_created_total,
            partitions_dropped_total,
            timescaledb_enabled,
        })
    }

    /// Registry attached to `/metrics` by the server
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_event_written(&self, event_type: &str, duration_secs: f64) {
        self.events_written_total
            .with_label_values(&[event_type])
            .inc();
        self.event_write_duration_seconds.observe(duration_secs);
    }

    pub fn record_event_write_error(&self, error_type: &str) {
        self.event_write_errors_total
            .with_label_values(&[error_type])
            .inc();
    }

    /// Record a query outcome; latency only for successful queries
    pub fn record_query(&self, operation: &str, duration_secs: f64, success: bool) {
        let status = if success { "success" } else { "error" };
        self.queries_total
            .with_label_values(&[operation, status])
            .inc();
        if success {
            self.query_duration_seconds
                .with_label_values(&[operation])
                .observe(duration_secs);
        }
    }

    pub fn record_pool_status(&self, total: u32, idle: usize) {
        let total = total as usize;
        self.pool_connections_total.set(total as f64);
        self.pool_connections_idle.set(idle as f64);
        self.pool_connections_active
            .set(total.saturating_sub(idle) as f64);
    }

    pub fn record_migration(&self, version: &str, duration_secs: f64) {
        self.migration_duration_seconds
            .with_label_values(&[version])
            .observe(duration_secs);
    }

    pub fn set_migrations_applied(&self, count: usize) {
        self.migrations_applied_total.set(count as f64);
    }

    pub fn set_timescaledb_enabled(&self, database: &str, enabled: bool) {
        self.timescaledb_enabled
            .with_label_values(&[database])
            .set(if enabled { 1.0 } else { 0.0 });
    }
}
