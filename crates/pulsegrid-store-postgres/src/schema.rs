//! SchemaManager - idempotent DDL for extensions, tables and indices

use pulsegrid_core::Result;
use sqlx::PgPool;
use tracing::{debug, info, warn};

use crate::error::classify;

/// Tenants, users, the event hypertable source and the partitioned audit table
const TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS tenants (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        domain TEXT NOT NULL UNIQUE,
        schema_name TEXT NOT NULL UNIQUE,
        plan TEXT NOT NULL DEFAULT 'free'
            CHECK (plan IN ('free', 'starter', 'professional', 'enterprise')),
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    );

    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        email TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'member',
        permissions TEXT[] NOT NULL DEFAULT '{}',
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (tenant_id, email)
    );

    CREATE TABLE IF NOT EXISTS activity_events (
        id UUID NOT NULL DEFAULT gen_random_uuid(),
        tenant_id UUID NOT NULL REFERENCES tenants(id),
        user_id UUID,
        event_type TEXT NOT NULL,
        value DOUBLE PRECISION,
        payload JSONB NOT NULL DEFAULT '{}',
        occurred_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (tenant_id, occurred_at, id)
    );

    CREATE TABLE IF NOT EXISTS connection_attempts (
        id UUID NOT NULL DEFAULT gen_random_uuid(),
        tenant_id UUID,
        user_id UUID,
        ip_address TEXT NOT NULL,
        user_agent TEXT,
        fingerprint TEXT NOT NULL,
        success BOOLEAN NOT NULL,
        reason TEXT,
        attempted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (attempted_at, id)
    ) PARTITION BY RANGE (attempted_at);
"#;

const INDICES_SQL: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_users_tenant
    ON users(tenant_id);

    CREATE INDEX IF NOT EXISTS idx_activity_events_tenant_time
    ON activity_events(tenant_id, occurred_at DESC);

    CREATE INDEX IF NOT EXISTS idx_activity_events_type
    ON activity_events(tenant_id, event_type, occurred_at DESC);

    CREATE INDEX IF NOT EXISTS idx_activity_events_user
    ON activity_events(tenant_id, user_id, occurred_at DESC);

    CREATE INDEX IF NOT EXISTS idx_connection_attempts_ip
    ON connection_attempts(ip_address, attempted_at DESC);

    CREATE INDEX IF NOT EXISTS idx_connection_attempts_tenant
    ON connection_attempts(tenant_id, attempted_at DESC);
"#;

/// Outcome of `SchemaManager::initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaReport {
    pub timescale_enabled: bool,
}

/// Owns the base DDL. Runs as the pool's login role.
pub struct SchemaManager {
    pool: PgPool,
}

impl SchemaManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create extensions, tables and indices. Safe to run repeatedly.
    pub async fn initialize(&self) -> Result<SchemaReport> {
        let timescale_enabled = self.create_extensions().await?;
        self.create_tables().await?;
        self.create_indices().await?;
        info!(timescale_enabled, "Schema initialized");
        Ok(SchemaReport { timescale_enabled })
    }

    /// Whether the TimescaleDB extension can be installed on this server
    pub async fn timescale_available(&self) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_available_extensions WHERE name = 'timescaledb')",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify(e, "Failed to check TimescaleDB availability"))
    }

    /// Returns whether TimescaleDB ended up enabled
    pub async fn create_extensions(&self) -> Result<bool> {
        sqlx::raw_sql("CREATE EXTENSION IF NOT EXISTS pgcrypto")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create pgcrypto extension"))?;

        if !self.timescale_available().await? {
            warn!("TimescaleDB extension not available, time-series features disabled");
            return Ok(false);
        }

        sqlx::raw_sql("CREATE EXTENSION IF NOT EXISTS timescaledb")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create timescaledb extension"))?;
        debug!("TimescaleDB extension enabled");
        Ok(true)
    }

    pub async fn create_tables(&self) -> Result<()> {
        sqlx::raw_sql(TABLES_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create tables"))?;
        Ok(())
    }

    pub async fn create_indices(&self) -> Result<()> {
        sqlx::raw_sql(INDICES_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to create indices"))?;
        Ok(())
    }

    /// Whether a table exists in the current search path
    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify(e, "Failed to check table existence"))
    }
}
