//! Tenant types and the tenant handle used to reach tenant-scoped storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Unique identifier for a tenant (organization).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    /// Create a new random tenant ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a tenant ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a tenant ID from a string
    pub fn from_string(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| Error::InvalidTenant(format!("Invalid tenant ID format: {}", e)))?;
        Ok(Self(uuid))
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_string(s)
    }
}

/// Database access level a handle operates under.
///
/// Each level maps to one of the graduated database roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

/// Explicit tenant context for every storage call.
///
/// Storage never infers the tenant from ambient state: callers hand a
/// `TenantHandle` to the gateway, which asserts the matching session context
/// on the connection before any tenant-scoped statement runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantHandle {
    tenant_id: Option<TenantId>,
    schema: Option<String>,
    access: AccessLevel,
}

impl TenantHandle {
    /// Read/write handle for a tenant
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            schema: None,
            access: AccessLevel::Write,
        }
    }

    /// Read-only handle for a tenant
    pub fn read_only(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
            schema: None,
            access: AccessLevel::Read,
        }
    }

    /// Cross-tenant administrative handle. Bypasses row-level filtering.
    pub fn admin() -> Self {
        Self {
            tenant_id: None,
            schema: None,
            access: AccessLevel::Admin,
        }
    }

    /// Attach a per-tenant schema; it becomes the connection's search path.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Result<Self> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(Error::InvalidTenant(format!(
                "Invalid schema identifier: {}",
                schema
            )));
        }
        self.schema = Some(schema);
        Ok(self)
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    /// Get the tenant ID, failing for the admin handle
    pub fn require_tenant(&self) -> Result<TenantId> {
        self.tenant_id
            .ok_or_else(|| Error::InvalidTenant("Operation requires a tenant handle".to_string()))
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn access(&self) -> AccessLevel {
        self.access
    }

    pub fn is_admin(&self) -> bool {
        self.access == AccessLevel::Admin
    }

    /// Value written into the session context variable. Empty means "no tenant".
    pub fn context_value(&self) -> String {
        self.tenant_id.map(|t| t.to_string()).unwrap_or_default()
    }
}

/// Lowercase SQL identifier: letters, digits and underscores, not starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Subscription plan of a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    Free,
    Starter,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Free => "free",
            SubscriptionPlan::Starter => "starter",
            SubscriptionPlan::Professional => "professional",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }
}

impl FromStr for SubscriptionPlan {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "free" => Ok(SubscriptionPlan::Free),
            "starter" => Ok(SubscriptionPlan::Starter),
            "professional" => Ok(SubscriptionPlan::Professional),
            "enterprise" => Ok(SubscriptionPlan::Enterprise),
            other => Err(Error::InvalidTenant(format!(
                "Unknown subscription plan: {}",
                other
            ))),
        }
    }
}

/// A provisioned tenant. Tenants are deactivated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub domain: String,
    pub schema_name: String,
    pub plan: SubscriptionPlan,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for tenant provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTenant {
    pub domain: String,
    pub schema_name: String,
    pub plan: SubscriptionPlan,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_creation() {
        let id1 = TenantId::new();
        let id2 = TenantId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_tenant_id_from_string() {
        let uuid_str = "550e8400-e29b-41d4-a716-446655440000";
        let tenant_id = TenantId::from_string(uuid_str).unwrap();
        assert_eq!(tenant_id.to_string(), uuid_str);
    }

    #[test]
    fn test_tenant_id_invalid_string() {
        assert!(TenantId::from_string("not-a-uuid").is_err());
    }

    #[test]
    fn test_admin_handle_has_empty_context() {
        let handle = TenantHandle::admin();
        assert!(handle.is_admin());
        assert_eq!(handle.context_value(), "");
        assert!(handle.require_tenant().is_err());
    }

    #[test]
    fn test_tenant_handle_context_value() {
        let tenant = TenantId::new();
        let handle = TenantHandle::new(tenant);
        assert_eq!(handle.context_value(), tenant.to_string());
        assert_eq!(handle.access(), AccessLevel::Write);
        assert_eq!(TenantHandle::read_only(tenant).access(), AccessLevel::Read);
    }

    #[test]
    fn test_schema_identifier_validation() {
        let tenant = TenantId::new();
        assert!(TenantHandle::new(tenant).with_schema("tenant_acme").is_ok());
        assert!(TenantHandle::new(tenant).with_schema("Acme").is_err());
        assert!(TenantHandle::new(tenant).with_schema("x; DROP TABLE users").is_err());
        assert!(TenantHandle::new(tenant).with_schema("1abc").is_err());
    }

    #[test]
    fn test_plan_round_trip_names() {
        for plan in [
            SubscriptionPlan::Free,
            SubscriptionPlan::Starter,
            SubscriptionPlan::Professional,
            SubscriptionPlan::Enterprise,
        ] {
            assert_eq!(plan.as_str().parse::<SubscriptionPlan>().unwrap(), plan);
        }
        assert!("gold".parse::<SubscriptionPlan>().is_err());
    }
}
