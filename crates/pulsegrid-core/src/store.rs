//! Storage traits consumed by the realtime layer
//!
//! The realtime gateway depends on these abstractions rather than on a
//! concrete database, so the PostgreSQL store and in-memory test doubles are
//! interchangeable.

use async_trait::async_trait;

use crate::{
    Result,
    auth::ConnectionAttempt,
    events::{ActivityEvent, EventQuery, NewActivityEvent},
    tenant::{TenantHandle, TenantId},
    user::{User, UserId},
};

/// Tenant-scoped activity event storage
///
/// Implementations:
/// - `PostgresStore`: TimescaleDB hypertable guarded by row-level security
/// - in-memory doubles used by the end-to-end tests
///
/// # Example
/// ```no_run
/// # use pulsegrid_core::store::EventStore;
/// # use pulsegrid_core::events::NewActivityEvent;
/// # use pulsegrid_core::tenant::{TenantHandle, TenantId};
/// # async fn example(store: &dyn EventStore) -> pulsegrid_core::Result<()> {
/// let handle = TenantHandle::new(TenantId::new());
/// let event = store
///     .record_event(&handle, NewActivityEvent::new("page_view").with_value(1.0))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append one event under the handle's tenant
    ///
    /// # Errors
    /// - `Error::ConstraintViolation` for invalid events
    /// - `Error::Permission` if the database refuses the write
    /// - `Error::Connection` / `Error::Timeout` for transient failures
    async fn record_event(
        &self,
        tenant: &TenantHandle,
        event: NewActivityEvent,
    ) -> Result<ActivityEvent>;

    /// Read events visible to the handle's tenant, newest first
    async fn query_events(
        &self,
        tenant: &TenantHandle,
        query: &EventQuery,
    ) -> Result<Vec<ActivityEvent>>;
}

/// User lookup used during connection authentication
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Find a user inside the given tenant. Returns `Ok(None)` when the user
    /// does not exist or belongs to a different tenant.
    async fn find_user(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<User>>;
}

/// Durable sink for connection-attempt audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_attempt(&self, attempt: &ConnectionAttempt) -> Result<()>;
}

/// Sink that discards attempts; the in-process tracker still sees them
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record_attempt(&self, _attempt: &ConnectionAttempt) -> Result<()> {
        Ok(())
    }
}
