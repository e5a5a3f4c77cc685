//! Sessions, connection-attempt audit records and rejection reasons

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::tenant::TenantId;
use crate::user::UserId;

/// Authenticated realtime session. Lives in the shared session cache with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub fingerprint: String,
    pub socket_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Session {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_activity).num_seconds() >= self.ttl_secs as i64
    }
}

/// Why a connection attempt was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    IpBanned,
    RateLimited,
    NoToken,
    InvalidToken,
    UserNotFound,
    UserInactive,
    ConnectionLimit,
}

impl RejectReason {
    pub const ALL: [RejectReason; 7] = [
        RejectReason::IpBanned,
        RejectReason::RateLimited,
        RejectReason::NoToken,
        RejectReason::InvalidToken,
        RejectReason::UserNotFound,
        RejectReason::UserInactive,
        RejectReason::ConnectionLimit,
    ];

    /// Internal reason code, as recorded in the audit trail
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::IpBanned => "IP_BANNED",
            RejectReason::RateLimited => "RATE_LIMITED",
            RejectReason::NoToken => "NO_TOKEN",
            RejectReason::InvalidToken => "INVALID_TOKEN",
            RejectReason::UserNotFound => "USER_NOT_FOUND",
            RejectReason::UserInactive => "USER_INACTIVE",
            RejectReason::ConnectionLimit => "CONNECTION_LIMIT",
        }
    }

    /// Code returned to the client. Lookup failures collapse into
    /// `INVALID_TOKEN` so callers cannot enumerate users.
    pub fn public_code(&self) -> &'static str {
        match self {
            RejectReason::UserNotFound | RejectReason::UserInactive => "INVALID_TOKEN",
            other => other.as_str(),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            RejectReason::IpBanned => 403,
            RejectReason::RateLimited | RejectReason::ConnectionLimit => 429,
            RejectReason::NoToken
            | RejectReason::InvalidToken
            | RejectReason::UserNotFound
            | RejectReason::UserInactive => 401,
        }
    }

    fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            RejectReason::InvalidToken | RejectReason::UserNotFound | RejectReason::UserInactive
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refusal of a connection, carrying the internal reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRejection {
    pub reason: RejectReason,
    pub message: String,
}

impl AuthRejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    /// Message safe to show an external caller
    pub fn public_message(&self) -> String {
        if self.reason.is_credential_failure() {
            "invalid credentials".to_string()
        } else {
            self.message.clone()
        }
    }
}

impl fmt::Display for AuthRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.message)
    }
}

impl std::error::Error for AuthRejection {}

/// Audit record of one handshake attempt. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub ip: String,
    pub user_agent: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub reason: Option<RejectReason>,
    pub fingerprint: String,
    pub tenant_id: Option<TenantId>,
    pub user_id: Option<UserId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes_serialize_screaming_snake() {
        let json = serde_json::to_string(&RejectReason::ConnectionLimit).unwrap();
        assert_eq!(json, "\"CONNECTION_LIMIT\"");
        for reason in RejectReason::ALL {
            let encoded = serde_json::to_string(&reason).unwrap();
            assert_eq!(encoded.trim_matches('"'), reason.as_str());
        }
    }

    #[test]
    fn test_credential_failures_collapse_publicly() {
        let not_found = AuthRejection::new(RejectReason::UserNotFound, "user 42 missing");
        let inactive = AuthRejection::new(RejectReason::UserInactive, "user 42 disabled");
        let bad = AuthRejection::new(RejectReason::InvalidToken, "signature mismatch");
        for r in [&not_found, &inactive, &bad] {
            assert_eq!(r.reason.public_code(), "INVALID_TOKEN");
            assert_eq!(r.public_message(), "invalid credentials");
        }
        let banned = AuthRejection::new(RejectReason::IpBanned, "ip banned");
        assert_eq!(banned.reason.public_code(), "IP_BANNED");
        assert_eq!(banned.public_message(), "ip banned");
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Session {
            session_id: "s1".to_string(),
            user_id: UserId::new(),
            tenant_id: TenantId::new(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: None,
            fingerprint: "abc".to_string(),
            socket_id: "sock".to_string(),
            created_at: now,
            last_activity: now,
            ttl_secs: 60,
        };
        assert!(!session.is_expired_at(now + chrono::Duration::seconds(59)));
        assert!(session.is_expired_at(now + chrono::Duration::seconds(60)));
    }
}
