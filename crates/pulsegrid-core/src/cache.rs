//! Shared session cache abstraction
//!
//! The cache is the durable source of truth for session TTLs, per-user
//! connection counters and per-IP handshake counters. Every key carries a TTL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::{Result, auth::Session, user::UserId};

/// Key for a single session record
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Key for the set of session IDs owned by a user
pub fn user_sessions_key(user_id: UserId) -> String {
    format!("user:{}:sessions", user_id)
}

/// Key for a user's open connection counter
pub fn user_connections_key(user_id: UserId) -> String {
    format!("user:{}:connections", user_id)
}

/// Key for the handshake rate counter of an IP
pub fn rate_limit_key(ip: &str) -> String {
    format!("rate_limit:{}", ip)
}

/// Result of a windowed counter increment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Count inside the current window, including this increment
    pub count: u64,
    /// When the current window expires
    pub reset_at: DateTime<Utc>,
}

#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Store a session under `session:{id}` and index it in `user:{id}:sessions`
    async fn put_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Refresh `last_activity` and extend the TTL. Returns false if the
    /// session has already expired.
    async fn touch_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn remove_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Live session IDs of a user
    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<String>>;

    /// Increment the user's connection counter, refreshing its TTL
    async fn incr_connections(&self, user_id: UserId, ttl: Duration) -> Result<u64>;

    /// Decrement the user's connection counter, saturating at zero
    async fn decr_connections(&self, user_id: UserId) -> Result<u64>;

    async fn connection_count(&self, user_id: UserId) -> Result<u64>;

    /// Increment a fixed-window counter; the TTL is set when the window opens
    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        let user = UserId::new();
        assert_eq!(session_key("abc"), "session:abc");
        assert_eq!(user_sessions_key(user), format!("user:{}:sessions", user));
        assert_eq!(user_connections_key(user), format!("user:{}:connections", user));
        assert_eq!(rate_limit_key("10.1.2.3"), "rate_limit:10.1.2.3");
    }
}
