//! Redis-backed session cache shared by every gateway instance

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulsegrid_core::auth::Session;
use pulsegrid_core::cache::{
    SessionCache, WindowCount, session_key, user_connections_key, user_sessions_key,
};
use pulsegrid_core::user::UserId;
use pulsegrid_core::{Error, Result};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

fn cache_error(e: redis::RedisError) -> Error {
    Error::Cache(e.to_string())
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Decrement a connection counter without letting it go below zero.
/// A counter that reaches zero is deleted; one left without an expiry gets
/// `ARGV[1]` seconds.
const DECR_CONNECTIONS_LUA: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 1 then
    redis.call('DEL', KEYS[1])
    return 0
end
local value = redis.call('DECR', KEYS[1])
if redis.call('TTL', KEYS[1]) < 0 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

const DEFAULT_COUNTER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone)]
pub struct RedisSessionCache {
    conn: ConnectionManager,
    decr_connections: redis::Script,
    /// Expiry restored on a connection counter that has lost its own
    counter_ttl: Duration,
}

impl RedisSessionCache {
    /// Connect and keep a self-reconnecting connection
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(cache_error)?;
        let conn = ConnectionManager::new(client).await.map_err(cache_error)?;
        Ok(Self::from_manager(conn))
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self {
            conn,
            decr_connections: redis::Script::new(DECR_CONNECTIONS_LUA),
            counter_ttl: DEFAULT_COUNTER_TTL,
        }
    }

    pub fn with_counter_ttl(mut self, ttl: Duration) -> Self {
        self.counter_ttl = ttl;
        self
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(())
    }

    async fn write_session(&self, session: &Session, only_if_exists: bool) -> Result<bool> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(session)?;

        let mut cmd = redis::cmd("SET");
        cmd.arg(session_key(&session.session_id))
            .arg(payload)
            .arg("EX")
            .arg(ttl_secs(session.ttl()));
        if only_if_exists {
            cmd.arg("XX");
        }
        let result: Option<String> = cmd.query_async(&mut conn).await.map_err(cache_error)?;
        Ok(result.is_some())
    }
}

#[async_trait]
impl SessionCache for RedisSessionCache {
    async fn put_session(&self, session: &Session) -> Result<()> {
        self.write_session(session, false).await?;

        let mut conn = self.conn.clone();
        let index = user_sessions_key(session.user_id);
        let _: () = redis::pipe()
            .atomic()
            .sadd(&index, &session.session_id)
            .ignore()
            .expire(&index, ttl_secs(session.ttl()) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;

        debug!(session_id = %session.session_id, user_id = %session.user_id, "Session stored");
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(session_key(session_id))
            .await
            .map_err(cache_error)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(mut session) = self.get_session(session_id).await? else {
            return Ok(false);
        };
        session.last_activity = now;
        // XX: a session that expired since the read stays expired
        self.write_session(&session, true).await
    }

    async fn remove_session(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(session) = self.get_session(session_id).await? else {
            return Ok(None);
        };
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(session_key(session_id))
            .ignore()
            .srem(user_sessions_key(session.user_id), session_id)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(Some(session))
    }

    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let index = user_sessions_key(user_id);
        let ids: Vec<String> = conn.smembers(&index).await.map_err(cache_error)?;

        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            let exists: bool = conn.exists(session_key(&id)).await.map_err(cache_error)?;
            if exists {
                live.push(id);
            } else {
                let _: () = conn.srem(&index, &id).await.map_err(cache_error)?;
            }
        }
        Ok(live)
    }

    async fn incr_connections(&self, user_id: UserId, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let key = user_connections_key(user_id);
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, ttl_secs(ttl) as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(count)
    }

    async fn decr_connections(&self, user_id: UserId) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .decr_connections
            .key(user_connections_key(user_id))
            .arg(ttl_secs(self.counter_ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(cache_error)?;
        Ok(value.max(0) as u64)
    }

    async fn connection_count(&self, user_id: UserId) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(user_connections_key(user_id))
            .await
            .map_err(cache_error)?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1).await.map_err(cache_error)?;
        let mut ttl_ms: i64 = conn.pttl(key).await.map_err(cache_error)?;
        // -1: the counter has no expiry yet (first hit, or a lost EXPIRE)
        if count == 1 || ttl_ms < 0 {
            let _: () = conn
                .pexpire(key, window.as_millis() as i64)
                .await
                .map_err(cache_error)?;
            ttl_ms = window.as_millis() as i64;
        }
        Ok(WindowCount {
            count,
            reset_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms),
        })
    }
}
