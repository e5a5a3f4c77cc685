//! In-process session cache
//!
//! Mirrors the Redis key layout and TTL behavior for single-node deployments
//! and tests. Expired entries are dropped lazily when touched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulsegrid_core::Result;
use pulsegrid_core::auth::Session;
use pulsegrid_core::cache::{
    SessionCache, WindowCount, session_key, user_connections_key, user_sessions_key,
};
use pulsegrid_core::user::UserId;
use std::collections::BTreeSet;
use std::time::Duration;

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
pub struct MemorySessionCache {
    sessions: DashMap<String, Expiring<Session>>,
    user_sessions: DashMap<String, Expiring<BTreeSet<String>>>,
    counters: DashMap<String, Expiring<u64>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_session_at(&self, session: &Session, now: DateTime<Utc>) {
        let expires_at = now + chrono_duration(session.ttl());
        self.sessions.insert(
            session_key(&session.session_id),
            Expiring {
                value: session.clone(),
                expires_at,
            },
        );
        let mut index = self
            .user_sessions
            .entry(user_sessions_key(session.user_id))
            .or_insert_with(|| Expiring {
                value: BTreeSet::new(),
                expires_at,
            });
        index.value.insert(session.session_id.clone());
        index.expires_at = index.expires_at.max(expires_at);
    }

    pub fn get_session_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let key = session_key(session_id);
        self.sessions.remove_if(&key, |_, entry| !entry.live_at(now));
        self.sessions.get(&key).map(|entry| entry.value.clone())
    }

    pub fn incr_connections_at(&self, user_id: UserId, ttl: Duration, now: DateTime<Utc>) -> u64 {
        let mut entry = self
            .counters
            .entry(user_connections_key(user_id))
            .or_insert(Expiring {
                value: 0,
                expires_at: now,
            });
        if !entry.live_at(now) {
            entry.value = 0;
        }
        entry.value += 1;
        entry.expires_at = now + chrono_duration(ttl);
        entry.value
    }

    pub fn connection_count_at(&self, user_id: UserId, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(&user_connections_key(user_id))
            .filter(|entry| entry.live_at(now))
            .map(|entry| entry.value)
            .unwrap_or(0)
    }

    pub fn incr_window_at(&self, key: &str, window: Duration, now: DateTime<Utc>) -> WindowCount {
        let mut entry = self.counters.entry(key.to_string()).or_insert(Expiring {
            value: 0,
            expires_at: now,
        });
        if !entry.live_at(now) {
            entry.value = 0;
            entry.expires_at = now + chrono_duration(window);
        }
        entry.value += 1;
        WindowCount {
            count: entry.value,
            reset_at: entry.expires_at,
        }
    }

    pub fn user_sessions_at(&self, user_id: UserId, now: DateTime<Utc>) -> Vec<String> {
        let key = user_sessions_key(user_id);
        let Some(ids) = self
            .user_sessions
            .get(&key)
            .filter(|entry| entry.live_at(now))
            .map(|entry| entry.value.clone())
        else {
            self.user_sessions.remove(&key);
            return Vec::new();
        };

        let live: Vec<String> = ids
            .into_iter()
            .filter(|id| self.get_session_at(id, now).is_some())
            .collect();
        if let Some(mut entry) = self.user_sessions.get_mut(&key) {
            entry.value.retain(|id| live.contains(id));
        }
        live
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn put_session(&self, session: &Session) -> Result<()> {
        self.put_session_at(session, Utc::now());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self.get_session_at(session_id, Utc::now()))
    }

    async fn touch_session(&self, session_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let key = session_key(session_id);
        self.sessions.remove_if(&key, |_, entry| !entry.live_at(now));
        match self.sessions.get_mut(&key) {
            Some(mut entry) => {
                entry.value.last_activity = now;
                entry.expires_at = now + chrono_duration(entry.value.ttl());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove_session(&self, session_id: &str) -> Result<Option<Session>> {
        let now = Utc::now();
        let removed = self
            .sessions
            .remove(&session_key(session_id))
            .map(|(_, entry)| entry)
            .filter(|entry| entry.live_at(now))
            .map(|entry| entry.value);
        if let Some(session) = &removed
            && let Some(mut index) = self.user_sessions.get_mut(&user_sessions_key(session.user_id))
        {
            index.value.remove(session_id);
        }
        Ok(removed)
    }

    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<String>> {
        Ok(self.user_sessions_at(user_id, Utc::now()))
    }

    async fn incr_connections(&self, user_id: UserId, ttl: Duration) -> Result<u64> {
        Ok(self.incr_connections_at(user_id, ttl, Utc::now()))
    }

    async fn decr_connections(&self, user_id: UserId) -> Result<u64> {
        let now = Utc::now();
        match self.counters.get_mut(&user_connections_key(user_id)) {
            Some(mut entry) if entry.live_at(now) => {
                entry.value = entry.value.saturating_sub(1);
                Ok(entry.value)
            }
            _ => Ok(0),
        }
    }

    async fn connection_count(&self, user_id: UserId) -> Result<u64> {
        Ok(self.connection_count_at(user_id, Utc::now()))
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<WindowCount> {
        Ok(self.incr_window_at(key, window, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsegrid_core::TenantId;

    fn session(id: &str, user_id: UserId, ttl_secs: u64, now: DateTime<Utc>) -> Session {
        Session {
            session_id: id.to_string(),
            user_id,
            tenant_id: TenantId::new(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: None,
            fingerprint: "fp".to_string(),
            socket_id: format!("sock-{}", id),
            created_at: now,
            last_activity: now,
            ttl_secs,
        }
    }

    #[tokio::test]
    async fn test_session_round_trip_and_removal() {
        let cache = MemorySessionCache::new();
        let user = UserId::new();
        let now = Utc::now();
        cache.put_session(&session("s1", user, 60, now)).await.unwrap();
        cache.put_session(&session("s2", user, 60, now)).await.unwrap();

        assert!(cache.get_session("s1").await.unwrap().is_some());
        let mut ids = cache.user_sessions(user).await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);

        let removed = cache.remove_session("s1").await.unwrap().unwrap();
        assert_eq!(removed.session_id, "s1");
        assert!(cache.get_session("s1").await.unwrap().is_none());
        assert_eq!(cache.user_sessions(user).await.unwrap(), vec!["s2".to_string()]);
        assert!(cache.remove_session("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_expires_without_activity() {
        let cache = MemorySessionCache::new();
        let user = UserId::new();
        let now = Utc::now();
        cache.put_session_at(&session("s1", user, 60, now), now);

        assert!(cache.get_session_at("s1", now + chrono::Duration::seconds(59)).is_some());
        assert!(cache.get_session_at("s1", now + chrono::Duration::seconds(60)).is_none());
        assert!(
            !cache
                .touch_session("s1", now + chrono::Duration::seconds(61))
                .await
                .unwrap()
        );
        assert!(cache.user_sessions_at(user, now + chrono::Duration::seconds(61)).is_empty());
    }

    #[tokio::test]
    async fn test_touch_extends_ttl() {
        let cache = MemorySessionCache::new();
        let now = Utc::now();
        cache.put_session_at(&session("s1", UserId::new(), 60, now), now);

        let later = now + chrono::Duration::seconds(50);
        assert!(cache.touch_session("s1", later).await.unwrap());
        let refreshed = cache
            .get_session_at("s1", now + chrono::Duration::seconds(100))
            .unwrap();
        assert_eq!(refreshed.last_activity, later);
    }

    #[tokio::test]
    async fn test_connection_counter_saturates() {
        let cache = MemorySessionCache::new();
        let user = UserId::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.incr_connections(user, ttl).await.unwrap(), 1);
        assert_eq!(cache.incr_connections(user, ttl).await.unwrap(), 2);
        assert_eq!(cache.connection_count(user).await.unwrap(), 2);
        assert_eq!(cache.decr_connections(user).await.unwrap(), 1);
        assert_eq!(cache.decr_connections(user).await.unwrap(), 0);
        assert_eq!(cache.decr_connections(user).await.unwrap(), 0);
        assert_eq!(cache.decr_connections(UserId::new()).await.unwrap(), 0);
    }

    #[test]
    fn test_fixed_window_counter() {
        let cache = MemorySessionCache::new();
        let now = Utc::now();
        let window = Duration::from_secs(60);

        let first = cache.incr_window_at("rate_limit:1.2.3.4", window, now);
        assert_eq!(first.count, 1);
        assert_eq!(first.reset_at, now + chrono::Duration::seconds(60));

        let second = cache.incr_window_at(
            "rate_limit:1.2.3.4",
            window,
            now + chrono::Duration::seconds(30),
        );
        assert_eq!(second.count, 2);
        assert_eq!(second.reset_at, first.reset_at);

        let next = cache.incr_window_at(
            "rate_limit:1.2.3.4",
            window,
            now + chrono::Duration::seconds(60),
        );
        assert_eq!(next.count, 1);
    }
}
