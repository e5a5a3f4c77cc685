//! TimeSeriesManager - TimescaleDB hypertable, compression, retention and
//! continuous aggregates for the activity event table.
//!
//! Continuous aggregates are materialized on a schedule and only finalize a
//! bucket once it is older than the policy's end offset. Rollup reads are
//! therefore bounded-stale: `query_rollup` returns the bound alongside rows.
//! Aggregate views are not covered by row-level security, so rollup queries
//! always filter by the caller's tenant explicitly.

use chrono::{DateTime, Utc};
use pulsegrid_core::{Error, Result, TenantHandle};
use serde::Serialize;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::classify;
use crate::gateway::ConnectionGateway;
use crate::sql::{checked_ident, interval, quote_literal};

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Rollup bucket width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
}

impl Granularity {
    pub const ALL: [Granularity; 3] = [Self::Hourly, Self::Daily, Self::Weekly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }

    pub fn bucket_width(&self) -> Duration {
        match self {
            Self::Hourly => Duration::from_secs(HOUR),
            Self::Daily => Duration::from_secs(DAY),
            Self::Weekly => Duration::from_secs(7 * DAY),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(Error::Config(format!("Unknown granularity: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionPolicy {
    /// Chunks older than this are compressed
    pub compress_after: Duration,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Chunks older than this are dropped
    pub drop_after: Duration,
}

/// A continuous aggregate and its refresh policy
#[derive(Debug, Clone)]
pub struct ContinuousAggregate {
    pub granularity: Granularity,
    /// Oldest bucket edge the refresh job revisits
    pub start_offset: Duration,
    /// Buckets newer than this are left for late data to settle
    pub end_offset: Duration,
    pub schedule_interval: Duration,
}

impl ContinuousAggregate {
    pub fn hourly() -> Self {
        Self {
            granularity: Granularity::Hourly,
            start_offset: Duration::from_secs(3 * DAY),
            end_offset: Duration::from_secs(HOUR),
            schedule_interval: Duration::from_secs(30 * 60),
        }
    }

    pub fn daily() -> Self {
        Self {
            granularity: Granularity::Daily,
            start_offset: Duration::from_secs(30 * DAY),
            end_offset: Duration::from_secs(DAY),
            schedule_interval: Duration::from_secs(HOUR),
        }
    }

    pub fn weekly() -> Self {
        Self {
            granularity: Granularity::Weekly,
            start_offset: Duration::from_secs(12 * 7 * DAY),
            end_offset: Duration::from_secs(DAY),
            schedule_interval: Duration::from_secs(DAY),
        }
    }

    pub fn view_name(&self, table: &str) -> String {
        format!("{}_{}", table, self.granularity.as_str())
    }

    /// Upper bound on how far the view lags the raw table
    pub fn max_staleness(&self) -> Duration {
        self.end_offset + self.schedule_interval
    }
}

/// Configuration for the event hypertable and its policies
#[derive(Debug, Clone)]
pub struct TimeSeriesConfig {
    pub table: String,
    pub time_column: String,
    /// Compression segment column
    pub segment_by: String,
    pub chunk_interval: Duration,
    pub compression: Option<CompressionPolicy>,
    pub retention: Option<RetentionPolicy>,
    pub aggregates: Vec<ContinuousAggregate>,
}

impl Default for TimeSeriesConfig {
    fn default() -> Self {
        Self {
            table: "activity_events".to_string(),
            time_column: "occurred_at".to_string(),
            segment_by: "tenant_id".to_string(),
            chunk_interval: Duration::from_secs(DAY),
            compression: Some(CompressionPolicy {
                compress_after: Duration::from_secs(7 * DAY),
            }),
            retention: Some(RetentionPolicy {
                drop_after: Duration::from_secs(90 * DAY),
            }),
            aggregates: vec![
                ContinuousAggregate::hourly(),
                ContinuousAggregate::daily(),
                ContinuousAggregate::weekly(),
            ],
        }
    }
}

impl TimeSeriesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_interval(mut self, chunk_interval: Duration) -> Self {
        self.chunk_interval = chunk_interval;
        self
    }

    /// `None` disables compression
    pub fn with_compression(mut self, compress_after: Option<Duration>) -> Self {
        self.compression = compress_after.map(|compress_after| CompressionPolicy { compress_after });
        self
    }

    /// `None` disables retention
    pub fn with_retention(mut self, drop_after: Option<Duration>) -> Self {
        self.retention = drop_after.map(|drop_after| RetentionPolicy { drop_after });
        self
    }

    pub fn with_aggregates(mut self, aggregates: Vec<ContinuousAggregate>) -> Self {
        self.aggregates = aggregates;
        self
    }

    pub fn aggregate(&self, granularity: Granularity) -> Option<&ContinuousAggregate> {
        self.aggregates
            .iter()
            .find(|a| a.granularity == granularity)
    }

    fn validate(&self) -> Result<()> {
        checked_ident(&self.table)?;
        checked_ident(&self.time_column)?;
        checked_ident(&self.segment_by)?;
        for aggregate in &self.aggregates {
            let window = aggregate.start_offset.saturating_sub(aggregate.end_offset);
            if window < aggregate.granularity.bucket_width() * 2 {
                return Err(Error::Config(format!(
                    "Refresh window for {} aggregate must cover at least two buckets",
                    aggregate.granularity.as_str()
                )));
            }
        }
        Ok(())
    }
}

pub fn hypertable_sql(config: &TimeSeriesConfig) -> String {
    format!(
        "SELECT create_hypertable({}, {}, chunk_time_interval => {}, if_not_exists => TRUE, migrate_data => TRUE)",
        quote_literal(&config.table),
        quote_literal(&config.time_column),
        interval(config.chunk_interval),
    )
}

pub fn compression_settings_sql(config: &TimeSeriesConfig) -> String {
    format!(
        "ALTER TABLE {} SET (timescaledb.compress, timescaledb.compress_segmentby = {}, timescaledb.compress_orderby = {})",
        config.table,
        quote_literal(&config.segment_by),
        quote_literal(&format!("{} DESC", config.time_column)),
    )
}

pub fn compression_policy_sql(config: &TimeSeriesConfig, policy: &CompressionPolicy) -> String {
    format!(
        "SELECT add_compression_policy({}, {}, if_not_exists => TRUE)",
        quote_literal(&config.table),
        interval(policy.compress_after),
    )
}

pub fn retention_policy_sql(config: &TimeSeriesConfig, policy: &RetentionPolicy) -> String {
    format!(
        "SELECT add_retention_policy({}, {}, if_not_exists => TRUE)",
        quote_literal(&config.table),
        interval(policy.drop_after),
    )
}

pub fn aggregate_view_sql(config: &TimeSeriesConfig, aggregate: &ContinuousAggregate) -> String {
    format!(
        "CREATE MATERIALIZED VIEW IF NOT EXISTS {view}\n\
         WITH (timescaledb.continuous) AS\n\
         SELECT time_bucket({width}, {time}) AS bucket,\n       \
                tenant_id,\n       \
                event_type,\n       \
                COUNT(*) AS event_count,\n       \
                SUM(value) AS value_sum,\n       \
                AVG(value) AS value_avg,\n       \
                MIN(value) AS value_min,\n       \
                MAX(value) AS value_max\n\
         FROM {table}\n\
         GROUP BY bucket, tenant_id, event_type\n\
         WITH NO DATA",
        view = aggregate.view_name(&config.table),
        width = interval(aggregate.granularity.bucket_width()),
        time = config.time_column,
        table = config.table,
    )
}

pub fn refresh_policy_sql(config: &TimeSeriesConfig, aggregate: &ContinuousAggregate) -> String {
    format!(
        "SELECT add_continuous_aggregate_policy({}, start_offset => {}, end_offset => {}, schedule_interval => {}, if_not_exists => TRUE)",
        quote_literal(&aggregate.view_name(&config.table)),
        interval(aggregate.start_offset),
        interval(aggregate.end_offset),
        interval(aggregate.schedule_interval),
    )
}

/// `after / before`, or `None` when nothing has been compressed
pub fn compression_ratio(before_bytes: Option<i64>, after_bytes: Option<i64>) -> Option<f64> {
    match (before_bytes, after_bytes) {
        (Some(before), Some(after)) if before > 0 => Some(after as f64 / before as f64),
        _ => None,
    }
}

/// What `setup` changed or found in place
#[derive(Debug, Clone, Default, Serialize)]
pub struct SetupReport {
    pub timescale_enabled: bool,
    pub hypertable: bool,
    pub compression: bool,
    pub retention: bool,
    pub aggregates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct HypertableInfo {
    pub hypertable_name: String,
    pub num_chunks: i64,
    pub compression_enabled: bool,
    pub total_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ChunkInfo {
    pub chunk_name: String,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub is_compressed: bool,
    pub total_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompressionStats {
    pub total_chunks: i64,
    pub compressed_chunks: i64,
    pub before_bytes: Option<i64>,
    pub after_bytes: Option<i64>,
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateInfo {
    pub view_name: String,
    pub granularity: Granularity,
    pub exists: bool,
    pub materialized_only: Option<bool>,
    pub schedule_interval_secs: u64,
    pub max_staleness_secs: u64,
}

/// Filter for `query_rollup`
#[derive(Debug, Clone)]
pub struct RollupQuery {
    pub granularity: Granularity,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub event_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RollupRow {
    pub bucket: DateTime<Utc>,
    pub event_type: String,
    pub event_count: i64,
    pub value_sum: Option<f64>,
    pub value_avg: Option<f64>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollupQueryResult {
    pub granularity: Granularity,
    pub rows: Vec<RollupRow>,
    /// Rows may miss events newer than this
    #[serde(with = "duration_secs")]
    pub max_staleness: Duration,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

pub struct TimeSeriesManager {
    gateway: ConnectionGateway,
    config: TimeSeriesConfig,
}

impl TimeSeriesManager {
    pub fn new(gateway: ConnectionGateway, config: TimeSeriesConfig) -> Self {
        Self { gateway, config }
    }

    pub fn config(&self) -> &TimeSeriesConfig {
        &self.config
    }

    fn pool(&self) -> &PgPool {
        self.gateway.pool()
    }

    pub async fn timescale_enabled(&self) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')")
            .fetch_one(self.pool())
            .await
            .map_err(|e| classify(e, "Failed to check TimescaleDB extension"))
    }

    /// Convert the table and install each enabled policy
    ///
    /// Must run before row-level security is enabled on the table: TimescaleDB
    /// refuses to create continuous aggregates over RLS-protected hypertables.
    pub async fn setup(&self) -> Result<SetupReport> {
        self.config.validate()?;

        let timescale_enabled = self.timescale_enabled().await?;
        if let Some(metrics) = self.gateway.metrics() {
            metrics.set_timescaledb_enabled("pulsegrid", timescale_enabled);
        }
        if !timescale_enabled {
            warn!("TimescaleDB not enabled, skipping hypertable setup");
            return Ok(SetupReport::default());
        }

        let mut report = SetupReport {
            timescale_enabled,
            ..Default::default()
        };

        self.create_hypertable().await?;
        report.hypertable = true;

        if let Some(policy) = &self.config.compression {
            self.enable_compression(policy).await?;
            report.compression = true;
        }

        if let Some(policy) = &self.config.retention {
            self.enable_retention(policy).await?;
            report.retention = true;
        }

        for aggregate in &self.config.aggregates {
            self.create_aggregate(aggregate).await?;
            report.aggregates.push(aggregate.view_name(&self.config.table));
        }

        info!(?report, "Time-series setup complete");
        Ok(report)
    }

    pub async fn is_hypertable(&self) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM timescaledb_information.hypertables WHERE hypertable_name = $1)",
        )
        .bind(&self.config.table)
        .fetch_one(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to check hypertable"))
    }

    async fn create_hypertable(&self) -> Result<()> {
        if self.is_hypertable().await? {
            debug!(table = %self.config.table, "Already a hypertable");
            return Ok(());
        }
        info!(table = %self.config.table, "Converting table to TimescaleDB hypertable");
        sqlx::raw_sql(&hypertable_sql(&self.config))
            .execute(self.pool())
            .await
            .map_err(|e| classify(e, "Failed to create hypertable"))?;
        Ok(())
    }

    async fn enable_compression(&self, policy: &CompressionPolicy) -> Result<()> {
        let enabled: Option<bool> = sqlx::query_scalar(
            "SELECT compression_enabled FROM timescaledb_information.hypertables WHERE hypertable_name = $1",
        )
        .bind(&self.config.table)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to read compression settings"))?;

        if !enabled.unwrap_or(false) {
            info!(table = %self.config.table, "Enabling compression");
            sqlx::raw_sql(&compression_settings_sql(&self.config))
                .execute(self.pool())
                .await
                .map_err(|e| classify(e, "Failed to enable compression"))?;
        }

        if !self.job_exists("policy_compression").await? {
            sqlx::raw_sql(&compression_policy_sql(&self.config, policy))
                .execute(self.pool())
                .await
                .map_err(|e| classify(e, "Failed to add compression policy"))?;
        }
        Ok(())
    }

    async fn enable_retention(&self, policy: &RetentionPolicy) -> Result<()> {
        if self.job_exists("policy_retention").await? {
            debug!(table = %self.config.table, "Retention policy already present");
            return Ok(());
        }
        sqlx::raw_sql(&retention_policy_sql(&self.config, policy))
            .execute(self.pool())
            .await
            .map_err(|e| classify(e, "Failed to add retention policy"))?;
        Ok(())
    }

    async fn create_aggregate(&self, aggregate: &ContinuousAggregate) -> Result<()> {
        let view = aggregate.view_name(&self.config.table);
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&view)
            .fetch_one(self.pool())
            .await
            .map_err(|e| classify(e, "Failed to check aggregate view"))?;

        if !exists {
            info!(view = %view, "Creating continuous aggregate");
            // One statement per call: continuous aggregates cannot be created in a transaction block
            sqlx::raw_sql(&aggregate_view_sql(&self.config, aggregate))
                .execute(self.pool())
                .await
                .map_err(|e| classify(e, &format!("Failed to create {}", view)))?;
        }

        sqlx::raw_sql(&refresh_policy_sql(&self.config, aggregate))
            .execute(self.pool())
            .await
            .map_err(|e| classify(e, &format!("Failed to add refresh policy for {}", view)))?;
        Ok(())
    }

    async fn job_exists(&self, proc_name: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM timescaledb_information.jobs WHERE proc_name = $1 AND hypertable_name = $2)",
        )
        .bind(proc_name)
        .bind(&self.config.table)
        .fetch_one(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to list background jobs"))
    }

    /// Read a rollup for the handle's tenant
    pub async fn query_rollup(
        &self,
        tenant: &TenantHandle,
        query: &RollupQuery,
    ) -> Result<RollupQueryResult> {
        let tenant_id = tenant.require_tenant()?;
        let aggregate = self.config.aggregate(query.granularity).ok_or_else(|| {
            Error::NotFound(format!(
                "No {} aggregate configured",
                query.granularity.as_str()
            ))
        })?;

        let sql = format!(
            "SELECT bucket, event_type, event_count, value_sum, value_avg, value_min, value_max \
             FROM {} \
             WHERE tenant_id = $1 AND bucket >= $2 AND bucket < $3 \
               AND ($4::text IS NULL OR event_type = $4) \
             ORDER BY bucket, event_type",
            aggregate.view_name(&self.config.table)
        );

        let mut conn = self.gateway.acquire(tenant).await?;
        let rows = sqlx::query_as::<_, RollupRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(query.since)
            .bind(query.until)
            .bind(&query.event_type)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| classify(e, "Failed to query rollup"))?;

        Ok(RollupQueryResult {
            granularity: query.granularity,
            rows,
            max_staleness: aggregate.max_staleness(),
        })
    }

    pub async fn hypertable_info(&self) -> Result<Vec<HypertableInfo>> {
        sqlx::query_as::<_, HypertableInfo>(
            "SELECT hypertable_name::text AS hypertable_name, \
                    num_chunks::bigint AS num_chunks, \
                    compression_enabled, \
                    hypertable_size(format('%I.%I', hypertable_schema, hypertable_name)::regclass)::bigint AS total_bytes \
             FROM timescaledb_information.hypertables \
             ORDER BY hypertable_name",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to read hypertable info"))
    }

    pub async fn chunk_info(&self) -> Result<Vec<ChunkInfo>> {
        sqlx::query_as::<_, ChunkInfo>(
            "SELECT chunk_name::text AS chunk_name, range_start, range_end, is_compressed, \
                    pg_total_relation_size(format('%I.%I', chunk_schema, chunk_name)::regclass)::bigint AS total_bytes \
             FROM timescaledb_information.chunks \
             WHERE hypertable_name = $1 \
             ORDER BY range_start",
        )
        .bind(&self.config.table)
        .fetch_all(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to read chunk info"))
    }

    pub async fn compression_stats(&self) -> Result<CompressionStats> {
        let row: Option<(Option<i64>, Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT total_chunks, number_compressed_chunks, \
                    before_compression_total_bytes, after_compression_total_bytes \
             FROM hypertable_compression_stats($1::regclass)",
        )
        .bind(&self.config.table)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to read compression stats"))?;

        let (total, compressed, before, after) = row.unwrap_or((None, None, None, None));
        Ok(CompressionStats {
            total_chunks: total.unwrap_or(0),
            compressed_chunks: compressed.unwrap_or(0),
            before_bytes: before,
            after_bytes: after,
            ratio: compression_ratio(before, after),
        })
    }

    pub async fn aggregate_info(&self) -> Result<Vec<AggregateInfo>> {
        let installed: Vec<(String, bool)> = sqlx::query_as(
            "SELECT view_name::text, materialized_only \
             FROM timescaledb_information.continuous_aggregates \
             WHERE hypertable_name = $1",
        )
        .bind(&self.config.table)
        .fetch_all(self.pool())
        .await
        .map_err(|e| classify(e, "Failed to read continuous aggregates"))?;

        Ok(self
            .config
            .aggregates
            .iter()
            .map(|aggregate| {
                let view_name = aggregate.view_name(&self.config.table);
                let found = installed.iter().find(|(name, _)| *name == view_name);
                AggregateInfo {
                    exists: found.is_some(),
                    materialized_only: found.map(|(_, m)| *m),
                    granularity: aggregate.granularity,
                    schedule_interval_secs: aggregate.schedule_interval.as_secs(),
                    max_staleness_secs: aggregate.max_staleness().as_secs(),
                    view_name,
                }
            })
            .collect())
    }
}
