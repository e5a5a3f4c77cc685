//! PulseGrid Observability
//!
//! This crate provides observability features:
//! - Metrics collection (Prometheus)
//! - Connection performance monitoring with alerts and tenant rollups
//! - Health endpoints

pub mod health;
pub mod metrics;
pub mod monitor;

pub use health::{ComponentStatus, HealthState, ReadinessChecker, health_router};
pub use metrics::Metrics;
pub use monitor::{
    Alert, AlertKind, AlertSeverity, AlertThresholds, ErrorClass, ErrorCounts, MonitorConfig,
    MonitorTask, PerformanceMonitor, PerformanceSnapshot, ResourceProbe, SysinfoProbe,
    TenantPerformance, spawn_monitor_task,
};
