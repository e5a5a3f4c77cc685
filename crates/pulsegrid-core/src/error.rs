//! Error types for PulseGrid Core

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::auth::AuthRejection;

#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: String, message: String },

    #[error("Database error: {0}")]
    Database(String),

    // Realtime errors
    #[error("Authentication rejected: {0}")]
    AuthRejected(AuthRejection),

    #[error("Rate limit exceeded: retry after {retry_after_ms}ms")]
    RateLimitExceeded {
        retry_after_ms: u64,
        reset_at: DateTime<Utc>,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    // Multi-tenancy errors
    #[error("Invalid tenant: {0}")]
    InvalidTenant(String),

    #[error("Tenant inactive: {0}")]
    TenantInactive(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the failed operation (with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// HTTP status code used when the error crosses the service boundary.
    pub fn client_status(&self) -> u16 {
        match self {
            Error::ConstraintViolation(_) => 409,
            Error::Permission(_) => 403,
            Error::AuthRejected(rejection) => rejection.reason.http_status(),
            Error::RateLimitExceeded { .. } => 429,
            Error::Connection(_) | Error::Timeout(_) => 503,
            Error::InvalidTenant(_) | Error::Serialization(_) => 400,
            Error::TenantInactive(_) => 403,
            Error::NotFound(_) => 404,
            _ => 500,
        }
    }

    /// Short machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Connection(_) => "CONNECTION_ERROR",
            Error::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            Error::Permission(_) => "PERMISSION_DENIED",
            Error::Timeout(_) => "TIMEOUT",
            Error::Migration { .. } => "MIGRATION_ERROR",
            Error::AuthRejected(rejection) => rejection.reason.public_code(),
            Error::RateLimitExceeded { .. } => "RATE_LIMITED",
            Error::InvalidTenant(_) => "INVALID_TENANT",
            Error::TenantInactive(_) => "TENANT_INACTIVE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Serialization(_) => "BAD_REQUEST",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl From<AuthRejection> for Error {
    fn from(rejection: AuthRejection) -> Self {
        Error::AuthRejected(rejection)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RejectReason;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(Error::Connection("pool timed out".to_string()).is_retryable());
        assert!(Error::Timeout("statement timeout".to_string()).is_retryable());
        assert!(!Error::Permission("rls".to_string()).is_retryable());
        assert!(!Error::ConstraintViolation("dup".to_string()).is_retryable());
        assert!(
            !Error::Migration {
                version: "20240101000000".to_string(),
                message: "boom".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_client_status_mapping() {
        assert_eq!(Error::ConstraintViolation("x".into()).client_status(), 409);
        assert_eq!(Error::Permission("x".into()).client_status(), 403);
        assert_eq!(
            Error::RateLimitExceeded {
                retry_after_ms: 10,
                reset_at: Utc::now()
            }
            .client_status(),
            429
        );
        assert_eq!(Error::Connection("x".into()).client_status(), 503);
    }

    #[test]
    fn test_auth_rejection_code_hides_lookup_failures() {
        let err: Error = AuthRejection::new(RejectReason::UserNotFound, "no such user").into();
        assert_eq!(err.code(), "INVALID_TOKEN");
        assert_eq!(err.client_status(), 401);
    }
}
