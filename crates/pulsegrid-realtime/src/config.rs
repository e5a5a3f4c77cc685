//! Configuration for the realtime auth gate

use pulsegrid_core::{Error, Result};
use std::net::IpAddr;
use std::time::Duration;

/// Limits and secrets for WebSocket authentication
#[derive(Debug, Clone)]
pub struct AuthGateConfig {
    /// Secret for access tokens
    pub jwt_secret: String,
    /// Secondary secret tried when the primary fails to verify
    pub refresh_secret: Option<String>,
    /// Session TTL in the shared cache, refreshed on activity
    pub session_ttl: Duration,
    pub max_connections_per_user: u64,
    /// Handshakes allowed per IP inside `handshake_window`
    pub handshake_limit: u64,
    pub handshake_window: Duration,
    /// Messages allowed per connection inside `message_window`
    pub message_limit: u32,
    pub message_window: Duration,
    /// Trailing window in which failed attempts accumulate
    pub abuse_window: Duration,
    /// Failed attempts inside `abuse_window` that ban an IP
    pub abuse_threshold: usize,
    pub ban_duration: Duration,
    pub max_connection_lifetime: Duration,
    pub max_events_per_session: u64,
    /// Attempts kept in memory for `audit_stats`
    pub recent_attempts_capacity: usize,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    /// Empty means the client address is always the socket peer.
    pub trusted_proxies: Vec<IpAddr>,
}

impl AuthGateConfig {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            refresh_secret: None,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            max_connections_per_user: 5,
            handshake_limit: 30,
            handshake_window: Duration::from_secs(60),
            message_limit: 100,
            message_window: Duration::from_secs(60),
            abuse_window: Duration::from_secs(5 * 60),
            abuse_threshold: 10,
            ban_duration: Duration::from_secs(60 * 60),
            max_connection_lifetime: Duration::from_secs(8 * 60 * 60),
            max_events_per_session: 10_000,
            recent_attempts_capacity: 1_000,
            trusted_proxies: Vec::new(),
        }
    }

    pub fn with_refresh_secret(mut self, secret: impl Into<String>) -> Self {
        self.refresh_secret = Some(secret.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_max_connections_per_user(mut self, max: u64) -> Self {
        self.max_connections_per_user = max;
        self
    }

    pub fn with_handshake_limit(mut self, limit: u64, window: Duration) -> Self {
        self.handshake_limit = limit;
        self.handshake_window = window;
        self
    }

    pub fn with_message_limit(mut self, limit: u32, window: Duration) -> Self {
        self.message_limit = limit;
        self.message_window = window;
        self
    }

    pub fn with_abuse_policy(mut self, window: Duration, threshold: usize, ban: Duration) -> Self {
        self.abuse_window = window;
        self.abuse_threshold = threshold;
        self.ban_duration = ban;
        self
    }

    pub fn with_connection_caps(mut self, lifetime: Duration, max_events: u64) -> Self {
        self.max_connection_lifetime = lifetime;
        self.max_events_per_session = max_events;
        self
    }

    pub fn with_trusted_proxies(mut self, proxies: impl IntoIterator<Item = IpAddr>) -> Self {
        self.trusted_proxies = proxies.into_iter().collect();
        self
    }

    /// Reject empty secrets and zero limits
    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.is_empty() {
            return Err(Error::Config("jwt_secret must not be empty".to_string()));
        }
        if matches!(&self.refresh_secret, Some(s) if s.is_empty()) {
            return Err(Error::Config(
                "refresh_secret must not be empty when set".to_string(),
            ));
        }
        let zero_limits = [
            ("max_connections_per_user", self.max_connections_per_user == 0),
            ("handshake_limit", self.handshake_limit == 0),
            ("message_limit", self.message_limit == 0),
            ("abuse_threshold", self.abuse_threshold == 0),
            ("max_events_per_session", self.max_events_per_session == 0),
        ];
        if let Some((name, _)) = zero_limits.iter().find(|(_, zero)| *zero) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        let zero_durations = [
            ("session_ttl", self.session_ttl),
            ("handshake_window", self.handshake_window),
            ("message_window", self.message_window),
            ("abuse_window", self.abuse_window),
            ("ban_duration", self.ban_duration),
            ("max_connection_lifetime", self.max_connection_lifetime),
        ];
        if let Some((name, _)) = zero_durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthGateConfig::new("secret");
        assert_eq!(config.session_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_connections_per_user, 5);
        assert_eq!(config.handshake_limit, 30);
        assert_eq!(config.message_limit, 100);
        assert_eq!(config.abuse_window, Duration::from_secs(300));
        assert_eq!(config.abuse_threshold, 10);
        assert_eq!(config.ban_duration, Duration::from_secs(3600));
        assert_eq!(config.max_connection_lifetime, Duration::from_secs(8 * 3600));
        assert_eq!(config.max_events_per_session, 10_000);
        assert!(config.trusted_proxies.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_secrets() {
        assert!(AuthGateConfig::new("").validate().is_err());
        assert!(
            AuthGateConfig::new("secret")
                .with_refresh_secret("")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let err = AuthGateConfig::new("secret")
            .with_message_limit(0, Duration::from_secs(60))
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("message_limit"));

        let err = AuthGateConfig::new("secret")
            .with_session_ttl(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("session_ttl"));
    }
}
