//! Per-tenant fan-out of stored events
//!
//! Each tenant gets its own `tokio::sync::broadcast` channel, created on the
//! first subscription and removed when the last subscriber goes away. A
//! subscriber can only ever see its own tenant's channel.

use async_trait::async_trait;
use dashmap::DashMap;
use pulsegrid_core::events::ActivityEvent;
use pulsegrid_core::{Result, TenantId};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default per-tenant channel capacity
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Delivery of a stored event to live subscribers
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Returns how many subscribers the event reached
    async fn publish(&self, event: &ActivityEvent) -> Result<usize>;
}

type Channels = Arc<DashMap<TenantId, broadcast::Sender<Arc<ActivityEvent>>>>;

#[derive(Clone)]
pub struct BroadcastHub {
    channels: Channels,
    capacity: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, tenant_id: TenantId) -> TenantSubscription {
        let receiver = self
            .channels
            .entry(tenant_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(%tenant_id, "Subscribed to tenant broadcasts");
        TenantSubscription {
            tenant_id,
            receiver: Some(receiver),
            channels: self.channels.clone(),
        }
    }

    pub fn subscriber_count(&self, tenant_id: TenantId) -> usize {
        self.channels
            .get(&tenant_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Tenants with a live channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send to the event's tenant channel; no channel means no subscribers
    pub fn send(&self, event: ActivityEvent) -> usize {
        match self.channels.get(&event.tenant_id) {
            // Err only when every receiver is gone
            Some(tx) => tx.send(Arc::new(event)).unwrap_or(0),
            None => 0,
        }
    }
}

#[async_trait]
impl EventPublisher for BroadcastHub {
    async fn publish(&self, event: &ActivityEvent) -> Result<usize> {
        Ok(self.send(event.clone()))
    }
}

/// Receiver for one tenant's events; dropping it may retire the channel
pub struct TenantSubscription {
    tenant_id: TenantId,
    receiver: Option<broadcast::Receiver<Arc<ActivityEvent>>>,
    channels: Channels,
}

impl TenantSubscription {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub async fn recv(&mut self) -> std::result::Result<Arc<ActivityEvent>, broadcast::error::RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }
}

impl Drop for TenantSubscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        if self
            .channels
            .remove_if(&self.tenant_id, |_, tx| tx.receiver_count() == 0)
            .is_some()
        {
            debug!(tenant_id = %self.tenant_id, "Retired tenant broadcast channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulsegrid_core::events::NewActivityEvent;

    fn event(tenant_id: TenantId) -> ActivityEvent {
        NewActivityEvent::new("page_view").into_event(tenant_id, Utc::now())
    }

    #[tokio::test]
    async fn test_events_reach_only_their_tenant() {
        let hub = BroadcastHub::default();
        let t1 = TenantId::new();
        let t2 = TenantId::new();
        let mut sub1 = hub.subscribe(t1);
        let mut sub2 = hub.subscribe(t2);

        let sent = event(t1);
        assert_eq!(hub.publish(&sent).await.unwrap(), 1);

        let received = sub1.recv().await.unwrap();
        assert_eq!(received.id, sent.id);
        let other = tokio::time::timeout(std::time::Duration::from_millis(50), sub2.recv()).await;
        assert!(other.is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_not_an_error() {
        let hub = BroadcastHub::default();
        assert_eq!(hub.publish(&event(TenantId::new())).await.unwrap(), 0);
    }

    #[test]
    fn test_channel_retired_with_last_subscriber() {
        let hub = BroadcastHub::default();
        let tenant = TenantId::new();
        let first = hub.subscribe(tenant);
        let second = hub.subscribe(tenant);
        assert_eq!(hub.subscriber_count(tenant), 2);

        drop(first);
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.subscriber_count(tenant), 1);

        drop(second);
        assert_eq!(hub.channel_count(), 0);
        assert_eq!(hub.send(event(tenant)), 0);
    }
}
