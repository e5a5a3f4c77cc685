//! Activity events: the append-only time-series fact

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tenant::TenantId;
use crate::user::UserId;

/// Upper bound on rows returned by a single event query
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Default number of rows returned when a query names no limit
pub const DEFAULT_QUERY_LIMIT: i64 = 100;

/// A persisted activity/usage event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub event_type: String,
    pub value: Option<f64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Event as submitted by a client, before the store assigns id and tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewActivityEvent {
    pub user_id: Option<UserId>,
    pub event_type: String,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Defaults to the write time when absent
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl NewActivityEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            user_id: None,
            event_type: event_type.into(),
            value: None,
            payload: serde_json::Value::Null,
            occurred_at: None,
        }
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Basic shape validation before the event reaches storage
    pub fn validate(&self) -> crate::Result<()> {
        if self.event_type.trim().is_empty() {
            return Err(crate::Error::ConstraintViolation(
                "event_type must not be empty".to_string(),
            ));
        }
        if self.event_type.len() > 128 {
            return Err(crate::Error::ConstraintViolation(
                "event_type exceeds 128 characters".to_string(),
            ));
        }
        if let Some(v) = self.value
            && !v.is_finite()
        {
            return Err(crate::Error::ConstraintViolation(
                "value must be a finite number".to_string(),
            ));
        }
        Ok(())
    }

    /// Materialize with store-assigned identity
    pub fn into_event(self, tenant_id: TenantId, now: DateTime<Utc>) -> ActivityEvent {
        ActivityEvent {
            id: Uuid::new_v4(),
            tenant_id,
            user_id: self.user_id,
            event_type: self.event_type,
            value: self.value,
            payload: self.payload,
            occurred_at: self.occurred_at.unwrap_or(now),
        }
    }
}

/// Filter for tenant-scoped event reads
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

impl EventQuery {
    /// Limit clamped into `1..=MAX_QUERY_LIMIT`
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    /// In-memory filter matching the SQL predicate
    pub fn matches(&self, event: &ActivityEvent) -> bool {
        self.since.is_none_or(|s| event.occurred_at >= s)
            && self.until.is_none_or(|u| event.occurred_at < u)
            && self
                .event_type
                .as_ref()
                .is_none_or(|t| &event.event_type == t)
    }
}
