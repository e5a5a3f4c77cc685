//! Server configuration
//!
//! Loaded from a YAML (default) or TOML file, then overridden by `PULSEGRID_*`
//! environment variables.

use pulsegrid_observability::MonitorConfig;
use pulsegrid_realtime::AuthGateConfig;
use pulsegrid_store_postgres::{PartitionConfig, PoolConfig, TimeSeriesConfig};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    FileRead(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub timeseries: TimeSeriesSettings,

    #[serde(default)]
    pub partitions: PartitionSettings,

    #[serde(default)]
    pub migrations: MigrationSettings,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_statement_timeout_secs")]
    pub statement_timeout_secs: u64,

    /// Switch to the access-level role on every acquire
    #[serde(default = "default_true")]
    pub switch_roles: bool,

    /// Create schema, time-series objects and policies when `serve` starts
    #[serde(default = "default_true")]
    pub initialize_on_startup: bool,
}

/// Shared session cache; sessions stay in process memory when no URL is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_secret: Option<String>,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: u64,

    #[serde(default = "default_handshake_limit")]
    pub handshake_limit: u64,

    #[serde(default = "default_window_secs")]
    pub handshake_window_secs: u64,

    #[serde(default = "default_message_limit")]
    pub message_limit: u32,

    #[serde(default = "default_window_secs")]
    pub message_window_secs: u64,

    #[serde(default = "default_abuse_window_secs")]
    pub abuse_window_secs: u64,

    #[serde(default = "default_abuse_threshold")]
    pub abuse_threshold: usize,

    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,

    #[serde(default = "default_max_connection_lifetime_secs")]
    pub max_connection_lifetime_secs: u64,

    #[serde(default = "default_max_events_per_session")]
    pub max_events_per_session: u64,

    /// Reverse proxies allowed to set `X-Forwarded-For` / `X-Real-IP`
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesSettings {
    #[serde(default = "default_chunk_interval_hours")]
    pub chunk_interval_hours: u64,

    /// `null` disables compression
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: Option<u64>,

    /// `null` keeps events forever
    #[serde(default = "default_retain_days")]
    pub retain_days: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSettings {
    #[serde(default = "default_days_ahead")]
    pub days_ahead: u32,

    /// Cap on `days` for `POST /admin/partitions`
    #[serde(default = "default_max_days_ahead")]
    pub max_days_ahead: u32,

    #[serde(default = "default_partition_retention_days")]
    pub retention_days: Option<u32>,

    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationSettings {
    #[serde(default = "default_migrations_dir")]
    pub directory: PathBuf,

    #[serde(default)]
    pub run_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Keep sqlx query logs at the base level instead of clamping them to warn
    #[serde(default)]
    pub log_sql_queries: bool,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: DatabaseSettings::default(),
            redis: RedisSettings::default(),
            auth: AuthSettings::default(),
            timeseries: TimeSeriesSettings::default(),
            partitions: PartitionSettings::default(),
            migrations: MigrationSettings::default(),
            monitor: MonitorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            statement_timeout_secs: default_statement_timeout_secs(),
            switch_roles: true,
            initialize_on_startup: true,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            refresh_secret: None,
            session_ttl_secs: default_session_ttl_secs(),
            max_connections_per_user: default_max_connections_per_user(),
            handshake_limit: default_handshake_limit(),
            handshake_window_secs: default_window_secs(),
            message_limit: default_message_limit(),
            message_window_secs: default_window_secs(),
            abuse_window_secs: default_abuse_window_secs(),
            abuse_threshold: default_abuse_threshold(),
            ban_duration_secs: default_ban_duration_secs(),
            max_connection_lifetime_secs: default_max_connection_lifetime_secs(),
            max_events_per_session: default_max_events_per_session(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for TimeSeriesSettings {
    fn default() -> Self {
        Self {
            chunk_interval_hours: default_chunk_interval_hours(),
            compress_after_days: default_compress_after_days(),
            retain_days: default_retain_days(),
        }
    }
}

impl Default for PartitionSettings {
    fn default() -> Self {
        Self {
            days_ahead: default_days_ahead(),
            max_days_ahead: default_max_days_ahead(),
            retention_days: default_partition_retention_days(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            directory: default_migrations_dir(),
            run_on_startup: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_sql_queries: false,
            json: false,
        }
    }
}

impl ServerConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::FileRead(format!("Failed to read {}: {}", path.display(), e))
        })?;

        if path.extension().and_then(|s| s.to_str()) == Some("toml") {
            toml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(format!("TOML parse error: {}", e)))
        } else {
            // Default to YAML
            serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::Parse(format!("YAML parse error: {}", e)))
        }
    }

    /// Merge environment variables into config (env vars take precedence)
    pub fn merge_env(&mut self) {
        if let Ok(val) = std::env::var("PULSEGRID_HOST") {
            self.host = val;
        }

        if let Ok(val) = std::env::var("PULSEGRID_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => eprintln!("Warning: Invalid PULSEGRID_PORT '{}', ignoring", val),
            }
        }

        if let Ok(val) = std::env::var("PULSEGRID_DATABASE_URL") {
            self.database.url = Some(val);
        }

        if let Ok(val) = std::env::var("PULSEGRID_REDIS_URL") {
            self.redis.url = Some(val);
        }

        if let Ok(val) = std::env::var("PULSEGRID_JWT_SECRET") {
            self.auth.jwt_secret = val;
        }

        if let Ok(val) = std::env::var("PULSEGRID_REFRESH_SECRET") {
            self.auth.refresh_secret = Some(val);
        }

        if let Ok(val) = std::env::var("PULSEGRID_LOG_LEVEL") {
            self.logging.level = val;
        }

        if let Ok(val) = std::env::var("PULSEGRID_MIGRATIONS_DIR") {
            self.migrations.directory = PathBuf::from(val);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Validation(
                "database.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Validation(
                "database.min_connections exceeds database.max_connections".to_string(),
            ));
        }
        if self.partitions.days_ahead == 0 {
            return Err(ConfigError::Validation(
                "partitions.days_ahead must be greater than zero".to_string(),
            ));
        }
        if self.partitions.days_ahead > self.partitions.max_days_ahead {
            return Err(ConfigError::Validation(
                "partitions.days_ahead must not exceed partitions.max_days_ahead".to_string(),
            ));
        }
        if self.monitor.sampling_interval.is_zero() {
            return Err(ConfigError::Validation(
                "monitor.sampling_interval must be greater than zero".to_string(),
            ));
        }
        self.auth_gate_config()
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database.url.as_deref().ok_or_else(|| {
            ConfigError::Validation(
                "database.url is required (or set PULSEGRID_DATABASE_URL)".to_string(),
            )
        })
    }

    pub fn auth_gate_config(&self) -> AuthGateConfig {
        let auth = &self.auth;
        let mut config = AuthGateConfig::new(auth.jwt_secret.clone())
            .with_session_ttl(Duration::from_secs(auth.session_ttl_secs))
            .with_max_connections_per_user(auth.max_connections_per_user)
            .with_handshake_limit(
                auth.handshake_limit,
                Duration::from_secs(auth.handshake_window_secs),
            )
            .with_message_limit(
                auth.message_limit,
                Duration::from_secs(auth.message_window_secs),
            )
            .with_abuse_policy(
                Duration::from_secs(auth.abuse_window_secs),
                auth.abuse_threshold,
                Duration::from_secs(auth.ban_duration_secs),
            )
            .with_connection_caps(
                Duration::from_secs(auth.max_connection_lifetime_secs),
                auth.max_events_per_session,
            )
            .with_trusted_proxies(auth.trusted_proxies.iter().copied());
        if let Some(refresh) = &auth.refresh_secret {
            config = config.with_refresh_secret(refresh.clone());
        }
        config
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .with_max_connections(self.database.max_connections)
            .with_min_connections(self.database.min_connections)
            .with_acquire_timeout(Duration::from_secs(self.database.acquire_timeout_secs))
            .with_statement_timeout(Duration::from_secs(self.database.statement_timeout_secs))
            .with_switch_roles(self.database.switch_roles)
    }

    pub fn timeseries_config(&self) -> TimeSeriesConfig {
        let ts = &self.timeseries;
        TimeSeriesConfig::new()
            .with_chunk_interval(Duration::from_secs(ts.chunk_interval_hours * HOUR_SECS))
            .with_compression(ts.compress_after_days.map(|d| Duration::from_secs(d * DAY_SECS)))
            .with_retention(ts.retain_days.map(|d| Duration::from_secs(d * DAY_SECS)))
    }

    pub fn partition_config(&self) -> PartitionConfig {
        PartitionConfig::new()
            .with_days_ahead(self.partitions.days_ahead)
            .with_max_days_ahead(self.partitions.max_days_ahead)
            .with_retention_days(self.partitions.retention_days)
            .with_maintenance_interval(Duration::from_secs(
                self.partitions.maintenance_interval_secs,
            ))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout_secs() -> u64 {
    5
}

fn default_statement_timeout_secs() -> u64 {
    30
}

fn default_session_ttl_secs() -> u64 {
    DAY_SECS
}

fn default_max_connections_per_user() -> u64 {
    5
}

fn default_handshake_limit() -> u64 {
    30
}

fn default_window_secs() -> u64 {
    60
}

fn default_message_limit() -> u32 {
    100
}

fn default_abuse_window_secs() -> u64 {
    5 * 60
}

fn default_abuse_threshold() -> usize {
    10
}

fn default_ban_duration_secs() -> u64 {
    HOUR_SECS
}

fn default_max_connection_lifetime_secs() -> u64 {
    8 * HOUR_SECS
}

fn default_max_events_per_session() -> u64 {
    10_000
}

fn default_chunk_interval_hours() -> u64 {
    24
}

fn default_compress_after_days() -> Option<u64> {
    Some(7)
}

fn default_retain_days() -> Option<u64> {
    Some(90)
}

fn default_days_ahead() -> u32 {
    7
}

fn default_max_days_ahead() -> u32 {
    90
}

fn default_partition_retention_days() -> Option<u32> {
    Some(30)
}

fn default_maintenance_interval_secs() -> u64 {
    HOUR_SECS
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn clear_env() {
        for key in [
            "PULSEGRID_HOST",
            "PULSEGRID_PORT",
            "PULSEGRID_DATABASE_URL",
            "PULSEGRID_REDIS_URL",
            "PULSEGRID_JWT_SECRET",
            "PULSEGRID_REFRESH_SECRET",
            "PULSEGRID_LOG_LEVEL",
            "PULSEGRID_MIGRATIONS_DIR",
        ] {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.auth.max_connections_per_user, 5);
        assert_eq!(config.auth.abuse_threshold, 10);
        assert!(config.redis.url.is_none());

        let gate = config.auth_gate_config();
        assert_eq!(gate.session_ttl, Duration::from_secs(86_400));
        assert_eq!(gate.ban_duration, Duration::from_secs(3_600));
        assert_eq!(gate.max_events_per_session, 10_000);
    }

    #[test]
    fn test_validate_requires_secret() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_err());

        config.auth.jwt_secret = "s3cret".to_string();
        assert!(config.validate().is_ok());

        config.auth.message_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_pool_bounds() {
        let mut config = ServerConfig::default();
        config.auth.jwt_secret = "s3cret".to_string();
        config.database.min_connections = 50;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_connections"));
    }

    #[test]
    fn test_validate_partition_horizon() {
        let mut config = ServerConfig::default();
        config.auth.jwt_secret = "s3cret".to_string();
        assert_eq!(config.partition_config().max_days_ahead, 90);

        config.partitions.days_ahead = 120;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_days_ahead"));

        config.partitions.max_days_ahead = 180;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
port: 9000
database:
  url: postgres://localhost/pulsegrid
  max_connections: 8
auth:
  jwt_secret: abc
  max_connections_per_user: 2
  trusted_proxies: ["10.0.0.1", "::1"]
timeseries:
  compress_after_days: null
logging:
  level: debug
  json: true
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.database.min_connections, 2);
        assert_eq!(config.auth.max_connections_per_user, 2);
        let trusted = config.auth_gate_config().trusted_proxies;
        assert_eq!(trusted.len(), 2);
        assert_eq!(trusted[0], "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(config.timeseries.compress_after_days.is_none());
        assert_eq!(config.timeseries.retain_days, Some(90));
        assert!(config.logging.json);
        assert!(config.timeseries_config().compression.is_none());
    }

    #[test]
    fn test_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
host = "0.0.0.0"

[auth]
jwt_secret = "abc"
message_limit = 20

[partitions]
days_ahead = 3
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.auth.message_limit, 20);
        assert_eq!(config.partition_config().days_ahead, 3);
    }

    #[test]
    fn test_unreadable_and_malformed_files() {
        assert!(matches!(
            ServerConfig::from_file("/nonexistent/pulsegrid.yaml"),
            Err(ConfigError::FileRead(_))
        ));

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "port: [not, a, port]").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides_file_values() {
        clear_env();
        unsafe {
            std::env::set_var("PULSEGRID_PORT", "7000");
            std::env::set_var("PULSEGRID_DATABASE_URL", "postgres://env/db");
            std::env::set_var("PULSEGRID_JWT_SECRET", "from-env");
            std::env::set_var("PULSEGRID_REDIS_URL", "redis://cache:6379");
        }

        let mut config = ServerConfig::default();
        config.port = 9000;
        config.auth.jwt_secret = "from-file".to_string();
        config.merge_env();

        assert_eq!(config.port, 7000);
        assert_eq!(config.database_url().unwrap(), "postgres://env/db");
        assert_eq!(config.auth.jwt_secret, "from-env");
        assert_eq!(config.redis.url.as_deref(), Some("redis://cache:6379"));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_invalid_env_port_is_ignored() {
        clear_env();
        unsafe {
            std::env::set_var("PULSEGRID_PORT", "not-a-port");
        }

        let mut config = ServerConfig::default();
        config.merge_env();
        assert_eq!(config.port, 8080);
        assert!(config.database_url().is_err());

        clear_env();
    }
}
