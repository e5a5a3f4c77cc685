//! Configuration for the PostgreSQL connection pool

use std::time::Duration;

/// Pool sizing, timeouts and role switching for `ConnectionGateway`
///
/// # Example
/// ```
/// use pulsegrid_store_postgres::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_max_connections(50)
///     .with_statement_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,

    /// Kept open even when idle
    pub min_connections: u32,

    /// Waiting longer than this surfaces as `Error::Connection`
    pub acquire_timeout: Duration,

    pub idle_timeout: Duration,

    pub max_lifetime: Duration,

    /// `statement_timeout` set on every new connection; expiry maps to `Error::Timeout`
    pub statement_timeout: Duration,

    /// Switch to the access-level database role on acquire.
    ///
    /// Requires the login role to be a member of the PulseGrid roles.
    /// Superusers bypass row-level security, so this must stay on whenever
    /// the pool logs in with a privileged account.
    pub switch_roles: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10 * 60),
            max_lifetime: Duration::from_secs(30 * 60),
            statement_timeout: Duration::from_secs(30),
            switch_roles: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_min_connections(mut self, min_connections: u32) -> Self {
        self.min_connections = min_connections;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_switch_roles(mut self, switch_roles: bool) -> Self {
        self.switch_roles = switch_roles;
        self
    }
}
