//! Write-then-notify event pipeline

use pulsegrid_core::events::{ActivityEvent, EventQuery, NewActivityEvent};
use pulsegrid_core::store::EventStore;
use pulsegrid_core::{Result, TenantHandle};
use pulsegrid_observability::Metrics;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::broadcast::EventPublisher;

/// Persists an event, then fans it out to the tenant's live subscribers.
///
/// The write is authoritative: once it succeeds the event is acknowledged
/// even if delivery fails, so a broadcast error never surfaces to the caller.
#[derive(Clone)]
pub struct EventPipeline {
    store: Arc<dyn EventStore>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Option<Arc<Metrics>>,
}

impl EventPipeline {
    pub fn new(store: Arc<dyn EventStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            store,
            publisher,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn submit(
        &self,
        handle: &TenantHandle,
        event: NewActivityEvent,
    ) -> Result<ActivityEvent> {
        event.validate()?;
        let stored = self.store.record_event(handle, event).await?;

        match self.publisher.publish(&stored).await {
            Ok(delivered) => {
                debug!(
                    tenant_id = %stored.tenant_id,
                    event_id = %stored.id,
                    delivered,
                    "Event broadcast"
                );
            }
            Err(e) => {
                warn!(
                    tenant_id = %stored.tenant_id,
                    event_id = %stored.id,
                    error = %e,
                    "Event stored but broadcast failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_broadcast_failure();
                }
            }
        }
        Ok(stored)
    }

    pub async fn query(&self, handle: &TenantHandle, query: &EventQuery) -> Result<Vec<ActivityEvent>> {
        self.store.query_events(handle, query).await
    }
}
