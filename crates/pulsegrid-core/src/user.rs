//! Users, roles and permissions

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::tenant::TenantId;
use crate::{Error, Result};

/// Unique identifier for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::NotFound(format!("Invalid user ID format: {}", e)))
    }
}

/// Individual permission. `Admin` implies every other tenant-scoped permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Admin,
    ReadEvents,
    WriteEvents,
    ManageUsers,
    ViewMetrics,
    /// Cross-tenant operator surface. Never granted by a role and not implied by `Admin`.
    PlatformOperator,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Admin => "admin",
            Permission::ReadEvents => "read_events",
            Permission::WriteEvents => "write_events",
            Permission::ManageUsers => "manage_users",
            Permission::ViewMetrics => "view_metrics",
            Permission::PlatformOperator => "platform_operator",
        }
    }

    /// True for permissions that reach beyond the holder's own tenant
    pub fn is_platform_scoped(&self) -> bool {
        matches!(self, Permission::PlatformOperator)
    }
}

impl FromStr for Permission {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Permission::Admin),
            "read_events" => Ok(Permission::ReadEvents),
            "write_events" => Ok(Permission::WriteEvents),
            "manage_users" => Ok(Permission::ManageUsers),
            "view_metrics" => Ok(Permission::ViewMetrics),
            "platform_operator" => Ok(Permission::PlatformOperator),
            other => Err(Error::Config(format!("Unknown permission: {}", other))),
        }
    }
}

/// User role; drives the default permission set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }

    pub fn default_permissions(&self) -> BTreeSet<Permission> {
        match self {
            Role::Viewer => [Permission::ReadEvents, Permission::ViewMetrics].into(),
            Role::Member => [
                Permission::ReadEvents,
                Permission::WriteEvents,
                Permission::ViewMetrics,
            ]
            .into(),
            Role::Admin | Role::Owner => [Permission::Admin].into(),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Role::Viewer),
            "member" => Ok(Role::Member),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(Error::Config(format!("Unknown role: {}", other))),
        }
    }
}

/// A user belonging to exactly one tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub role: Role,
    pub permissions: BTreeSet<Permission>,
    pub is_active: bool,
}

impl User {
    /// Permission check. `Admin` short-circuits tenant-scoped permissions;
    /// platform-scoped ones must be held explicitly.
    pub fn has_permission(&self, permission: Permission) -> bool {
        if self.permissions.contains(&permission) {
            return true;
        }
        !permission.is_platform_scoped() && self.permissions.contains(&Permission::Admin)
    }
}

/// Input for user creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub role: Role,
    /// Explicit permissions; the role defaults are used when empty
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
}

impl NewUser {
    pub fn effective_permissions(&self) -> BTreeSet<Permission> {
        if self.permissions.is_empty() {
            self.role.default_permissions()
        } else {
            self.permissions.clone()
        }
    }
}

/// Parse stored permission strings, skipping unknown values with a warning.
pub fn parse_permissions<I, S>(values: I) -> BTreeSet<Permission>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .filter_map(|v| match v.as_ref().parse::<Permission>() {
            Ok(p) => Some(p),
            Err(_) => {
                tracing::warn!(permission = v.as_ref(), "Ignoring unknown permission");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(permissions: &[Permission]) -> User {
        User {
            id: UserId::new(),
            tenant_id: TenantId::new(),
            email: "a@example.com".to_string(),
            role: Role::Member,
            permissions: permissions.iter().copied().collect(),
            is_active: true,
        }
    }

    #[test]
    fn test_admin_short_circuits_all_permissions() {
        let user = user_with(&[Permission::Admin]);
        assert!(user.has_permission(Permission::WriteEvents));
        assert!(user.has_permission(Permission::ManageUsers));
    }

    #[test]
    fn test_tenant_admin_is_not_platform_operator() {
        for role in [Role::Admin, Role::Owner] {
            let mut user = user_with(&[]);
            user.role = role;
            user.permissions = role.default_permissions();
            assert!(user.has_permission(Permission::ManageUsers));
            assert!(!user.has_permission(Permission::PlatformOperator));
        }

        let operator = user_with(&[Permission::PlatformOperator]);
        assert!(operator.has_permission(Permission::PlatformOperator));
        assert!(!operator.has_permission(Permission::WriteEvents));
        assert_eq!(
            "platform_operator".parse::<Permission>().unwrap(),
            Permission::PlatformOperator
        );
    }

    #[test]
    fn test_missing_permission_denied() {
        let user = user_with(&[Permission::ReadEvents]);
        assert!(user.has_permission(Permission::ReadEvents));
        assert!(!user.has_permission(Permission::WriteEvents));
    }

    #[test]
    fn test_role_defaults_apply_when_permissions_empty() {
        let new_user = NewUser {
            email: "v@example.com".to_string(),
            role: Role::Viewer,
            permissions: BTreeSet::new(),
        };
        let perms = new_user.effective_permissions();
        assert!(perms.contains(&Permission::ReadEvents));
        assert!(!perms.contains(&Permission::WriteEvents));
    }

    #[test]
    fn test_parse_permissions_skips_unknown() {
        let perms = parse_permissions(["read_events", "fly", "admin"]);
        assert_eq!(perms.len(), 2);
        assert!(perms.contains(&Permission::Admin));
    }
}
