//! PartitionManager - day-range partitions for natively partitioned tables
//!
//! Partitions are named `{parent}_pYYYYMMDD` and cover one UTC day. Creating
//! them ahead of time keeps partition DDL off the insert path.

use chrono::{DateTime, Days, NaiveDate, Utc};
use pulsegrid_core::{Error, Result};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::error::classify;
use crate::metrics::StoreMetrics;
use crate::sql::{checked_ident, quote_literal};

#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Range-partitioned parent table
    pub parent_table: String,
    /// Future days kept pre-created (today is always included)
    pub days_ahead: u32,
    /// Upper bound for any pre-creation request
    pub max_days_ahead: u32,
    /// Partitions older than this many days are dropped; `None` keeps everything
    pub retention_days: Option<u32>,
    pub maintenance_interval: Duration,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            parent_table: "connection_attempts".to_string(),
            days_ahead: 7,
            max_days_ahead: 90,
            retention_days: Some(30),
            maintenance_interval: Duration::from_secs(3600),
        }
    }
}

impl PartitionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parent_table(mut self, parent_table: impl Into<String>) -> Self {
        self.parent_table = parent_table.into();
        self
    }

    pub fn with_days_ahead(mut self, days_ahead: u32) -> Self {
        self.days_ahead = days_ahead;
        self
    }

    pub fn with_max_days_ahead(mut self, max_days_ahead: u32) -> Self {
        self.max_days_ahead = max_days_ahead;
        self
    }

    pub fn with_retention_days(mut self, retention_days: Option<u32>) -> Self {
        self.retention_days = retention_days;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }
}

pub fn partition_name(parent: &str, day: NaiveDate) -> String {
    format!("{}_p{}", parent, day.format("%Y%m%d"))
}

/// Inverse of `partition_name`
pub fn parse_partition_day(parent: &str, name: &str) -> Option<NaiveDate> {
    let suffix = name.strip_prefix(parent)?.strip_prefix("_p")?;
    NaiveDate::parse_from_str(suffix, "%Y%m%d").ok()
}

/// Days `today..=today + days_ahead`
pub fn expected_days(today: NaiveDate, days_ahead: u32) -> Vec<NaiveDate> {
    (0..=days_ahead as u64)
        .filter_map(|offset| today.checked_add_days(Days::new(offset)))
        .collect()
}

pub fn check_days_ahead(days: u32, max_days_ahead: u32) -> Result<()> {
    if days > max_days_ahead {
        return Err(Error::ConstraintViolation(format!(
            "cannot pre-create {} days of partitions (max {})",
            days, max_days_ahead
        )));
    }
    Ok(())
}

/// Expected partition names not present in `existing`
pub fn missing_partitions(
    parent: &str,
    today: NaiveDate,
    days_ahead: u32,
    existing: &BTreeSet<String>,
) -> Vec<String> {
    expected_days(today, days_ahead)
        .into_iter()
        .map(|day| partition_name(parent, day))
        .filter(|name| !existing.contains(name))
        .collect()
}

/// Partitions whose whole day lies before `today - retention_days`
pub fn expired_partitions<'a>(
    parent: &str,
    today: NaiveDate,
    retention_days: u32,
    existing: impl IntoIterator<Item = &'a String>,
) -> Vec<String> {
    let Some(cutoff) = today.checked_sub_days(Days::new(retention_days as u64)) else {
        return Vec::new();
    };
    existing
        .into_iter()
        .filter(|name| parse_partition_day(parent, name).is_some_and(|day| day < cutoff))
        .cloned()
        .collect()
}

pub fn create_partition_sql(parent: &str, day: NaiveDate) -> String {
    let next = day.checked_add_days(Days::new(1)).unwrap_or(day);
    format!(
        "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
        partition_name(parent, day),
        parent,
        quote_literal(&format!("{} 00:00:00+00", day.format("%Y-%m-%d"))),
        quote_literal(&format!("{} 00:00:00+00", next.format("%Y-%m-%d"))),
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionHealth {
    pub parent_table: String,
    pub healthy: bool,
    pub days_ahead: u32,
    pub expected: usize,
    pub missing: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PartitionInfo {
    pub name: String,
    pub bounds: String,
    pub total_bytes: i64,
}

pub struct PartitionManager {
    pool: PgPool,
    config: PartitionConfig,
    metrics: Option<StoreMetrics>,
}

impl PartitionManager {
    pub fn new(pool: PgPool, config: PartitionConfig) -> Result<Self> {
        checked_ident(&config.parent_table)?;
        Ok(Self {
            pool,
            config,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    async fn existing_names(&self) -> Result<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT c.relname::text FROM pg_inherits i \
             JOIN pg_class c ON c.oid = i.inhrelid \
             WHERE i.inhparent = to_regclass($1)",
        )
        .bind(&self.config.parent_table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to list partitions"))?;
        Ok(names.into_iter().collect())
    }

    /// Create partitions for today and the next `days` days
    ///
    /// Returns the names of partitions that did not exist before.
    pub async fn pre_create_partitions(&self, days: u32) -> Result<Vec<String>> {
        check_days_ahead(days, self.config.max_days_ahead)?;
        let parent = &self.config.parent_table;
        let existing = self.existing_names().await?;
        let today = Utc::now().date_naive();

        let mut created = Vec::new();
        for day in expected_days(today, days) {
            let name = partition_name(parent, day);
            if existing.contains(&name) {
                continue;
            }
            sqlx::raw_sql(&create_partition_sql(parent, day))
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, &format!("Failed to create partition {}", name)))?;
            debug!(partition = %name, "Created partition");
            created.push(name);
        }

        if let Some(metrics) = &self.metrics {
            metrics.partitions_created_total.inc_by(created.len() as u64);
        }
        if !created.is_empty() {
            info!(parent = %parent, count = created.len(), "Pre-created partitions");
        }
        Ok(created)
    }

    /// Unhealthy when any partition from today through `days_ahead` is missing
    pub async fn partition_health(&self, days_ahead: u32) -> Result<PartitionHealth> {
        let existing = self.existing_names().await?;
        let now = Utc::now();
        let missing = missing_partitions(
            &self.config.parent_table,
            now.date_naive(),
            days_ahead,
            &existing,
        );
        Ok(PartitionHealth {
            parent_table: self.config.parent_table.clone(),
            healthy: missing.is_empty(),
            days_ahead,
            expected: days_ahead as usize + 1,
            missing,
            checked_at: now,
        })
    }

    pub async fn list_partitions(&self) -> Result<Vec<PartitionInfo>> {
        sqlx::query_as::<_, PartitionInfo>(
            "SELECT c.relname::text AS name, \
                    pg_get_expr(c.relpartbound, c.oid) AS bounds, \
                    pg_total_relation_size(c.oid) AS total_bytes \
             FROM pg_inherits i \
             JOIN pg_class c ON c.oid = i.inhrelid \
             WHERE i.inhparent = to_regclass($1) \
             ORDER BY c.relname",
        )
        .bind(&self.config.parent_table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to list partitions"))
    }

    /// Drop partitions whose day ended more than `days` days ago
    pub async fn drop_partitions_older_than(&self, days: u32) -> Result<Vec<String>> {
        let existing = self.existing_names().await?;
        let expired = expired_partitions(
            &self.config.parent_table,
            Utc::now().date_naive(),
            days,
            &existing,
        );

        for name in &expired {
            sqlx::raw_sql(&format!("DROP TABLE IF EXISTS {}", name))
                .execute(&self.pool)
                .await
                .map_err(|e| classify(e, &format!("Failed to drop partition {}", name)))?;
            info!(partition = %name, "Dropped expired partition");
        }

        if let Some(metrics) = &self.metrics {
            metrics.partitions_dropped_total.inc_by(expired.len() as u64);
        }
        Ok(expired)
    }

    /// One maintenance pass: pre-create, then apply retention
    pub async fn run_maintenance(&self) -> Result<()> {
        self.pre_create_partitions(self.config.days_ahead).await?;
        if let Some(retention) = self.config.retention_days {
            self.drop_partitions_older_than(retention).await?;
        }
        Ok(())
    }
}

/// Handle for the background partition maintenance task
pub struct MaintenanceTask {
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

impl MaintenanceTask {
    /// Signal the maintenance task to shut down
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Spawn a task that runs `run_maintenance` on the configured interval
pub fn spawn_maintenance_task(manager: Arc<PartitionManager>) -> MaintenanceTask {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let interval = manager.config.maintenance_interval;
        info!(
            parent = %manager.config.parent_table,
            interval_secs = interval.as_secs(),
            "Starting partition maintenance task"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Partition maintenance task shutting down");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(e) = manager.run_maintenance().await {
                        error!(error = %e, "Partition maintenance failed");
                    }
                }
            }
        }
    });

    MaintenanceTask { shutdown_tx }
}
