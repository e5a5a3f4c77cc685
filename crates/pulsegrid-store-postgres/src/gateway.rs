//! ConnectionGateway - pooled connection and transaction access with explicit tenant context
//!
//! Every connection handed out by the gateway has had the tenant context
//! variable (and search path / database role) asserted as its first
//! statement. On release the pool resets the connection to a neutral state in
//! which row-level security denies every tenant-scoped row; a connection whose
//! reset fails is closed rather than reused.

use pulsegrid_core::{AccessLevel, Result, TenantHandle};
use serde::Serialize;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::PoolConfig;
use crate::error::classify;
use crate::metrics::StoreMetrics;
use crate::policy::{ROLE_ADMIN, ROLE_READ, ROLE_WRITE};
use crate::sql::quote_ident;

/// Session variable read by every row-level-security policy
pub const TENANT_CONTEXT_VAR: &str = "app.current_organization_id";

/// Search path used when a handle carries no per-tenant schema
const DEFAULT_SEARCH_PATH: &str = "\"$user\", public";

/// Statements that return a connection to the neutral (deny-all) state
const RESET_CONTEXT_SQL: &str = "RESET ROLE; \
     SELECT set_config('app.current_organization_id', '', false); \
     RESET search_path;";

/// Database role used for an access level
pub fn role_for(access: AccessLevel) -> &'static str {
    match access {
        AccessLevel::Read => ROLE_READ,
        AccessLevel::Write => ROLE_WRITE,
        AccessLevel::Admin => ROLE_ADMIN,
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub max_connections: u32,
}

/// Bounded pool wrapper that injects tenant context
#[derive(Clone)]
pub struct ConnectionGateway {
    pool: PgPool,
    config: PoolConfig,
    metrics: Option<StoreMetrics>,
}

impl ConnectionGateway {
    /// Connect a new pool
    ///
    /// # Errors
    /// - `Error::Connection` if the database is unreachable
    pub async fn connect(database_url: &str, config: PoolConfig) -> Result<Self> {
        let statement_timeout_ms = config.statement_timeout.as_millis() as u64;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    let sql = format!("SET statement_timeout = {}", statement_timeout_ms);
                    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql)).await?;
                    Ok(())
                })
            })
            .after_release(|conn, _meta| {
                Box::pin(async move {
                    match sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(RESET_CONTEXT_SQL)).await {
                        Ok(_) => Ok(true),
                        Err(e) => {
                            warn!(error = %e, "Failed to reset tenant context, closing connection");
                            Ok(false)
                        }
                    }
                })
            })
            .connect(database_url)
            .await
            .map_err(|e| classify(e, "Failed to connect to PostgreSQL"))?;

        Ok(Self::from_pool(pool, config))
    }

    /// Wrap an existing pool (useful for testing).
    ///
    /// The caller is responsible for the pool's release hook; `acquire`
    /// re-asserts context unconditionally either way.
    pub fn from_pool(pool: PgPool, config: PoolConfig) -> Self {
        Self {
            pool,
            config,
            metrics: None,
        }
    }

    /// Attach store metrics
    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn metrics(&self) -> Option<&StoreMetrics> {
        self.metrics.as_ref()
    }

    /// Raw pool, for schema management that runs as the login role
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire a connection with the handle's tenant context asserted
    pub async fn acquire(&self, tenant: &TenantHandle) -> Result<TenantConnection> {
        let started = Instant::now();
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| classify(e, "Failed to acquire connection"))?;
        self.observe_acquire(started);

        apply_context(&mut conn, tenant, self.config.switch_roles, false).await?;

        Ok(TenantConnection {
            conn,
            tenant: tenant.clone(),
        })
    }

    /// Begin a transaction with transaction-local tenant context
    ///
    /// Dropping the returned transaction without `commit` rolls it back.
    pub async fn begin(&self, tenant: &TenantHandle) -> Result<TenantTransaction> {
        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify(e, "Failed to begin transaction"))?;
        self.observe_acquire(started);

        apply_context(&mut tx, tenant, self.config.switch_roles, true).await?;

        Ok(TenantTransaction {
            tx,
            tenant: tenant.clone(),
        })
    }

    /// Check the database answers
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify(e, "Health check failed"))?;
        Ok(())
    }

    pub fn pool_status(&self) -> PoolStatus {
        let status = PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_connections: self.config.max_connections,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_pool_status(status.size, status.idle);
        }
        status
    }

    fn observe_acquire(&self, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics
                .pool_acquire_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }
    }
}

/// Assert tenant context on a connection.
///
/// Always sets every variable, even for the admin handle, so nothing from a
/// previous borrower survives.
async fn apply_context(
    conn: &mut PgConnection,
    tenant: &TenantHandle,
    switch_roles: bool,
    local: bool,
) -> Result<()> {
    let search_path = match tenant.schema() {
        Some(schema) => format!("{}, public", quote_ident(schema)),
        None => DEFAULT_SEARCH_PATH.to_string(),
    };

    sqlx::query("SELECT set_config($1, $2, $4), set_config('search_path', $3, $4)")
        .bind(TENANT_CONTEXT_VAR)
        .bind(tenant.context_value())
        .bind(&search_path)
        .bind(local)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to set tenant context"))?;

    if switch_roles {
        let scope = if local { "LOCAL " } else { "" };
        let sql = format!("SET {}ROLE {}", scope, role_for(tenant.access()));
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql))
            .await
            .map_err(|e| classify(e, "Failed to switch database role"))?;
    }

    debug!(
        tenant_id = %tenant.context_value(),
        access = ?tenant.access(),
        local,
        "Tenant context applied"
    );
    Ok(())
}

/// Pooled connection bound to one tenant handle
pub struct TenantConnection {
    conn: PoolConnection<Postgres>,
    tenant: TenantHandle,
}

impl TenantConnection {
    pub fn tenant(&self) -> &TenantHandle {
        &self.tenant
    }

    /// Reset context eagerly and return the connection to the pool
    pub async fn release(mut self) -> Result<()> {
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(RESET_CONTEXT_SQL))
            .await
            .map_err(|e| classify(e, "Failed to reset tenant context"))?;
        Ok(())
    }
}

impl Deref for TenantConnection {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.conn
    }
}

impl DerefMut for TenantConnection {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

/// Transaction bound to one tenant handle
pub struct TenantTransaction {
    tx: Transaction<'static, Postgres>,
    tenant: TenantHandle,
}

impl TenantTransaction {
    pub fn tenant(&self) -> &TenantHandle {
        &self.tenant
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| classify(e, "Failed to commit transaction"))
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| classify(e, "Failed to roll back transaction"))
    }
}

impl Deref for TenantTransaction {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for TenantTransaction {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}
