//! PostgresStore - tenant-scoped storage over the ConnectionGateway
//!
//! Implements the core `EventStore`, `UserDirectory` and `AuditSink` traits
//! plus tenant and user provisioning. Every statement runs on a connection
//! whose tenant context was asserted by the gateway.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsegrid_core::auth::ConnectionAttempt;
use pulsegrid_core::events::{ActivityEvent, EventQuery, NewActivityEvent};
use pulsegrid_core::store::{AuditSink, EventStore, UserDirectory};
use pulsegrid_core::tenant::{NewTenant, Tenant, is_valid_identifier};
use pulsegrid_core::user::{NewUser, parse_permissions};
use pulsegrid_core::{
    AccessLevel, Error, Result, Role, TenantHandle, TenantId, User, UserId,
};
use sqlx::FromRow;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RetryPolicy, classify, retry_transient};
use crate::gateway::ConnectionGateway;
use crate::policy::{ROLE_ADMIN, ROLE_READ, ROLE_WRITE};
use crate::sql::quote_ident;

#[derive(FromRow)]
struct TenantRow {
    id: Uuid,
    domain: String,
    schema_name: String,
    plan: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<TenantRow> for Tenant {
    type Error = Error;

    fn try_from(row: TenantRow) -> Result<Self> {
        Ok(Tenant {
            id: TenantId::from_uuid(row.id),
            domain: row.domain,
            schema_name: row.schema_name,
            plan: row.plan.parse()?,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    tenant_id: Uuid,
    email: String,
    role: String,
    permissions: Vec<String>,
    is_active: bool,
}

impl TryFrom<UserRow> for User {
    type Error = Error;

    fn try_from(row: UserRow) -> Result<Self> {
        Ok(User {
            id: UserId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            email: row.email,
            role: row.role.parse::<Role>()?,
            permissions: parse_permissions(&row.permissions),
            is_active: row.is_active,
        })
    }
}

#[derive(FromRow)]
struct EventRow {
    id: Uuid,
    tenant_id: Uuid,
    user_id: Option<Uuid>,
    event_type: String,
    value: Option<f64>,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl From<EventRow> for ActivityEvent {
    fn from(row: EventRow) -> Self {
        ActivityEvent {
            id: row.id,
            tenant_id: TenantId::from_uuid(row.tenant_id),
            user_id: row.user_id.map(UserId::from_uuid),
            event_type: row.event_type,
            value: row.value,
            payload: row.payload,
            occurred_at: row.occurred_at,
        }
    }
}

const TENANT_COLUMNS: &str = "id, domain, schema_name, plan, is_active, created_at";
const USER_COLUMNS: &str = "id, tenant_id, email, role, permissions, is_active";

/// PostgreSQL implementation of the storage traits
#[derive(Clone)]
pub struct PostgresStore {
    gateway: ConnectionGateway,
    retry: RetryPolicy,
}

impl PostgresStore {
    pub fn new(gateway: ConnectionGateway) -> Self {
        Self {
            gateway,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn gateway(&self) -> &ConnectionGateway {
        &self.gateway
    }

    /// Create a tenant and its schema namespace in one transaction
    ///
    /// # Errors
    /// - `Error::InvalidTenant` for a malformed schema name or empty domain
    /// - `Error::ConstraintViolation` when the domain or schema is taken
    pub async fn provision_tenant(&self, new: NewTenant) -> Result<Tenant> {
        if new.domain.trim().is_empty() {
            return Err(Error::InvalidTenant("domain must not be empty".to_string()));
        }
        if !is_valid_identifier(&new.schema_name) {
            return Err(Error::InvalidTenant(format!(
                "Invalid schema identifier: {}",
                new.schema_name
            )));
        }

        // Provisioning runs as the login role, which may create schemas
        let mut tx = self
            .gateway
            .pool()
            .begin()
            .await
            .map_err(|e| classify(e, "Failed to begin provisioning transaction"))?;

        let row: TenantRow = sqlx::query_as(&format!(
            "INSERT INTO tenants (domain, schema_name, plan) VALUES ($1, $2, $3) RETURNING {}",
            TENANT_COLUMNS
        ))
        .bind(&new.domain)
        .bind(&new.schema_name)
        .bind(new.plan.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(e, "Failed to insert tenant"))?;

        let schema = quote_ident(&new.schema_name);
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema}; \
             GRANT USAGE ON SCHEMA {schema} TO {read}, {write}, {admin};",
            schema = schema,
            read = ROLE_READ,
            write = ROLE_WRITE,
            admin = ROLE_ADMIN,
        );
        sqlx::raw_sql(&ddl)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, "Failed to create tenant schema"))?;

        tx.commit()
            .await
            .map_err(|e| classify(e, "Failed to commit tenant provisioning"))?;

        let tenant = Tenant::try_from(row)?;
        info!(tenant_id = %tenant.id, domain = %tenant.domain, "Tenant provisioned");
        Ok(tenant)
    }

    /// The handle's own tenant; admin handles may not use this
    pub async fn get_tenant(&self, tenant: &TenantHandle) -> Result<Option<Tenant>> {
        let tenant_id = tenant.require_tenant()?;
        let mut conn = self.gateway.acquire(tenant).await?;
        let row: Option<TenantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to fetch tenant"))?;
        row.map(Tenant::try_from).transpose()
    }

    /// All tenants, through the admin bypass
    pub async fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let mut conn = self.gateway.acquire(&TenantHandle::admin()).await?;
        let rows: Vec<TenantRow> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants ORDER BY created_at",
            TENANT_COLUMNS
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to list tenants"))?;
        rows.into_iter().map(Tenant::try_from).collect()
    }

    /// Tenants are never deleted, only deactivated
    pub async fn deactivate_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let mut conn = self.gateway.acquire(&TenantHandle::admin()).await?;
        let result = sqlx::query("UPDATE tenants SET is_active = FALSE WHERE id = $1")
            .bind(tenant_id.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, "Failed to deactivate tenant"))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Tenant {}", tenant_id)));
        }
        info!(tenant_id = %tenant_id, "Tenant deactivated");
        Ok(())
    }

    /// Create a user inside the handle's tenant context
    ///
    /// # Errors
    /// - `Error::TenantInactive` when the tenant is deactivated
    /// - `Error::ConstraintViolation` for a duplicate email within the tenant
    pub async fn create_user(&self, tenant: &TenantHandle, new: NewUser) -> Result<User> {
        let tenant_id = tenant.require_tenant()?;
        if new.email.trim().is_empty() {
            return Err(Error::ConstraintViolation(
                "email must not be empty".to_string(),
            ));
        }

        let mut tx = self.gateway.begin(tenant).await?;

        let active: Option<bool> = sqlx::query_scalar("SELECT is_active FROM tenants WHERE id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify(e, "Failed to check tenant"))?;
        match active {
            None => return Err(Error::InvalidTenant(format!("Unknown tenant {}", tenant_id))),
            Some(false) => return Err(Error::TenantInactive(tenant_id.to_string())),
            Some(true) => {}
        }

        let permissions: Vec<&str> = new
            .effective_permissions()
            .iter()
            .map(|p| p.as_str())
            .collect();

        let row: UserRow = sqlx::query_as(&format!(
            "INSERT INTO users (tenant_id, email, role, permissions) VALUES ($1, $2, $3, $4) RETURNING {}",
            USER_COLUMNS
        ))
        .bind(tenant_id.as_uuid())
        .bind(&new.email)
        .bind(new.role.as_str())
        .bind(&permissions)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify(e, "Failed to insert user"))?;

        tx.commit().await?;

        let user = User::try_from(row)?;
        info!(tenant_id = %tenant_id, user_id = %user.id, "User created");
        Ok(user)
    }

    pub async fn deactivate_user(&self, tenant: &TenantHandle, user_id: UserId) -> Result<()> {
        let mut conn = self.gateway.acquire(tenant).await?;
        let result = sqlx::query("UPDATE users SET is_active = FALSE WHERE id = $1")
            .bind(user_id.as_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|e| classify(e, "Failed to deactivate user"))?;
        // Rows of other tenants are invisible, so they count as missing
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("User {}", user_id)));
        }
        Ok(())
    }

    pub async fn list_users(&self, tenant: &TenantHandle) -> Result<Vec<User>> {
        let mut conn = self.gateway.acquire(tenant).await?;
        let rows: Vec<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users ORDER BY email",
            USER_COLUMNS
        ))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to list users"))?;
        rows.into_iter().map(User::try_from).collect()
    }

    async fn insert_event(&self, tenant: &TenantHandle, event: &ActivityEvent) -> Result<()> {
        let mut conn = self.gateway.acquire(tenant).await?;
        // Idempotent on retry after an ambiguous connection failure
        sqlx::query(
            "INSERT INTO activity_events (id, tenant_id, user_id, event_type, value, payload, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, occurred_at, id) DO NOTHING",
        )
        .bind(event.id)
        .bind(event.tenant_id.as_uuid())
        .bind(event.user_id.map(|u| *u.as_uuid()))
        .bind(&event.event_type)
        .bind(event.value)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to insert event"))?;
        Ok(())
    }

    async fn select_events(
        &self,
        tenant: &TenantHandle,
        tenant_id: TenantId,
        query: &EventQuery,
    ) -> Result<Vec<ActivityEvent>> {
        let mut conn = self.gateway.acquire(tenant).await?;
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT id, tenant_id, user_id, event_type, value, payload, occurred_at \
             FROM activity_events \
             WHERE tenant_id = $1 \
               AND ($2::timestamptz IS NULL OR occurred_at >= $2) \
               AND ($3::timestamptz IS NULL OR occurred_at < $3) \
               AND ($4::text IS NULL OR event_type = $4) \
             ORDER BY occurred_at DESC \
             LIMIT $5",
        )
        .bind(tenant_id.as_uuid())
        .bind(query.since)
        .bind(query.until)
        .bind(&query.event_type)
        .bind(query.effective_limit())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to query events"))?;
        Ok(rows.into_iter().map(ActivityEvent::from).collect())
    }
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn record_event(
        &self,
        tenant: &TenantHandle,
        event: NewActivityEvent,
    ) -> Result<ActivityEvent> {
        let tenant_id = tenant.require_tenant()?;
        if tenant.access() == AccessLevel::Read {
            return Err(Error::Permission(
                "Read-only handle cannot record events".to_string(),
            ));
        }
        event.validate()?;

        let event = event.into_event(tenant_id, Utc::now());
        let started = Instant::now();
        let result = retry_transient(&self.retry, || self.insert_event(tenant, &event)).await;

        let metrics = self.gateway.metrics();
        match result {
            Ok(()) => {
                if let Some(metrics) = metrics {
                    metrics.record_event_written(&event.event_type, started.elapsed().as_secs_f64());
                }
                debug!(tenant_id = %tenant_id, event_id = %event.id, "Event recorded");
                Ok(event)
            }
            Err(e) => {
                if let Some(metrics) = metrics {
                    metrics.record_event_write_error(e.code());
                }
                warn!(tenant_id = %tenant_id, error = %e, "Event write failed");
                Err(e)
            }
        }
    }

    async fn query_events(
        &self,
        tenant: &TenantHandle,
        query: &EventQuery,
    ) -> Result<Vec<ActivityEvent>> {
        let tenant_id = tenant.require_tenant()?;
        let started = Instant::now();
        let result =
            retry_transient(&self.retry, || self.select_events(tenant, tenant_id, query)).await;
        if let Some(metrics) = self.gateway.metrics() {
            metrics.record_query("query_events", started.elapsed().as_secs_f64(), result.is_ok());
        }
        result
    }
}

#[async_trait]
impl UserDirectory for PostgresStore {
    async fn find_user(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<User>> {
        let handle = TenantHandle::read_only(tenant_id);
        let mut conn = self.gateway.acquire(&handle).await?;
        let row: Option<UserRow> = sqlx::query_as(&format!(
            "SELECT {} FROM users WHERE id = $1 AND tenant_id = $2",
            USER_COLUMNS
        ))
        .bind(user_id.as_uuid())
        .bind(tenant_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to look up user"))?;
        row.map(User::try_from).transpose()
    }
}

#[async_trait]
impl AuditSink for PostgresStore {
    async fn record_attempt(&self, attempt: &ConnectionAttempt) -> Result<()> {
        let mut conn = self.gateway.acquire(&TenantHandle::admin()).await?;
        sqlx::query(
            "INSERT INTO connection_attempts \
             (tenant_id, user_id, ip_address, user_agent, fingerprint, success, reason, attempted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(attempt.tenant_id.map(|t| *t.as_uuid()))
        .bind(attempt.user_id.map(|u| *u.as_uuid()))
        .bind(&attempt.ip)
        .bind(&attempt.user_agent)
        .bind(&attempt.fingerprint)
        .bind(attempt.success)
        .bind(attempt.reason.map(|r| r.as_str()))
        .bind(attempt.timestamp)
        .execute(&mut *conn)
        .await
        .map_err(|e| classify(e, "Failed to record connection attempt"))?;
        Ok(())
    }
}
