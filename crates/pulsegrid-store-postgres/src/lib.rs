//! PostgreSQL storage for multi-tenant PulseGrid deployments
//!
//! Tenant isolation is enforced by the database: every tenant-scoped table
//! carries row-level-security policies keyed on a per-session context
//! variable, and the `ConnectionGateway` asserts that variable on every
//! connection it hands out.
//!
//! # Components
//! - `SchemaManager`: extensions, tables and indices
//! - `PolicyEngine`: roles, grants and row-level-security policies
//! - `MigrationManager`: file-based migrations with rollback
//! - `TimeSeriesManager`: TimescaleDB hypertable, compression, retention and
//!   continuous aggregates (TimescaleDB optional)
//! - `PartitionManager`: day partitions for the connection audit table
//! - `ConnectionGateway`: pooled access with tenant context
//! - `PostgresStore`: the core storage traits over the gateway
//!
//! # Example
//! ```no_run
//! # use pulsegrid_store_postgres::{ConnectionGateway, PoolConfig, PostgresStore};
//! # use pulsegrid_core::store::EventStore;
//! # use pulsegrid_core::events::NewActivityEvent;
//! # use pulsegrid_core::{TenantHandle, TenantId};
//! # async fn example() -> pulsegrid_core::Result<()> {
//! let gateway = ConnectionGateway::connect("postgres://localhost/pulsegrid", PoolConfig::default()).await?;
//! let store = PostgresStore::new(gateway);
//! let handle = TenantHandle::new(TenantId::new());
//! store.record_event(&handle, NewActivityEvent::new("page_view")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod migrations;
pub mod partitions;
pub mod policy;
pub mod schema;
pub mod sql;
pub mod store;
pub mod timeseries;

pub use config::PoolConfig;
pub use error::{RetryPolicy, retry_transient};
pub use gateway::{ConnectionGateway, PoolStatus, TENANT_CONTEXT_VAR, TenantConnection, TenantTransaction};
pub use metrics::StoreMetrics;
pub use migrations::{MigrationIssue, MigrationManager, MigrationRecord, MigrationStatus};
pub use partitions::{PartitionConfig, PartitionHealth, PartitionManager, spawn_maintenance_task};
pub use policy::PolicyEngine;
pub use schema::{SchemaManager, SchemaReport};
pub use store::PostgresStore;
pub use timeseries::{Granularity, RollupQuery, TimeSeriesConfig, TimeSeriesManager};

/// Full idempotent initialization in dependency order
///
/// Continuous aggregates must exist before row-level security is switched on
/// for their source table, so time-series setup runs between table creation
/// and policy installation.
pub async fn initialize_database(
    gateway: &ConnectionGateway,
    timeseries: TimeSeriesConfig,
) -> pulsegrid_core::Result<timeseries::SetupReport> {
    let pool = gateway.pool().clone();
    SchemaManager::new(pool.clone()).initialize().await?;
    let report = TimeSeriesManager::new(gateway.clone(), timeseries)
        .setup()
        .await?;
    PolicyEngine::new(pool).install().await?;
    Ok(report)
}
