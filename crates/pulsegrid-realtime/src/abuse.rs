//! Connection-attempt tracking and IP bans
//!
//! Owned by one `RealtimeAuthGate`. Failed attempts accumulate per IP inside a
//! trailing window; reaching the threshold bans the IP for a fixed duration.
//! Bans expire lazily on the next lookup. IPs whose failures have all left the
//! window are dropped on their next attempt or by `sweep_at`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulsegrid_core::auth::{ConnectionAttempt, RejectReason};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::AuthGateConfig;

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis().min(i64::MAX as u128) as i64)
}

fn prune(failures: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while failures.front().is_some_and(|t| *t <= cutoff) {
        failures.pop_front();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ban {
    pub ip: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Imposed by an operator rather than abuse detection
    pub manual: bool,
}

/// Snapshot returned by `RealtimeAuthGate::audit_stats`
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub by_reason: BTreeMap<String, u64>,
    pub active_bans: Vec<Ban>,
    /// Newest first
    pub recent_attempts: Vec<ConnectionAttempt>,
}

pub struct AbuseTracker {
    window: chrono::Duration,
    threshold: usize,
    ban_duration: Duration,
    recent_capacity: usize,
    failures: DashMap<String, VecDeque<DateTime<Utc>>>,
    bans: DashMap<String, Ban>,
    recent: Mutex<VecDeque<ConnectionAttempt>>,
    total: AtomicU64,
    successful: AtomicU64,
    by_reason: DashMap<RejectReason, u64>,
}

impl AbuseTracker {
    pub fn new(config: &AuthGateConfig) -> Self {
        Self {
            window: chrono_duration(config.abuse_window),
            threshold: config.abuse_threshold,
            ban_duration: config.ban_duration,
            recent_capacity: config.recent_attempts_capacity,
            failures: DashMap::new(),
            bans: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
            total: AtomicU64::new(0),
            successful: AtomicU64::new(0),
            by_reason: DashMap::new(),
        }
    }

    /// When the IP's ban ends, if it is banned at `now`
    pub fn ban_expiry_at(&self, ip: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.bans.remove_if(ip, |_, ban| ban.expires_at <= now);
        self.bans.get(ip).map(|ban| ban.expires_at)
    }

    /// Failed attempts from the IP inside the trailing window
    pub fn failure_count_at(&self, ip: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.failures
            .get(ip)
            .map(|f| f.iter().filter(|t| **t > cutoff).count())
            .unwrap_or(0)
    }

    /// Record an attempt. Returns the ban this attempt triggered, if any.
    pub fn record_at(&self, attempt: &ConnectionAttempt, now: DateTime<Utc>) -> Option<Ban> {
        self.total.fetch_add(1, Ordering::Relaxed);
        {
            let mut recent = self
                .recent
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            recent.push_back(attempt.clone());
            while recent.len() > self.recent_capacity {
                recent.pop_front();
            }
        }

        if attempt.success {
            self.successful.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let reason = attempt.reason?;
        *self.by_reason.entry(reason).or_insert(0) += 1;

        // Attempts refused by an existing ban do not extend it
        if reason == RejectReason::IpBanned || self.ban_expiry_at(&attempt.ip, now).is_some() {
            return None;
        }

        let cutoff = now - self.window;
        let count = {
            let mut failures = self.failures.entry(attempt.ip.clone()).or_default();
            failures.push_back(now);
            prune(&mut failures, cutoff);
            failures.len()
        };

        if count >= self.threshold {
            self.failures.remove(&attempt.ip);
            Some(self.ban_at(&attempt.ip, self.ban_duration, now, false))
        } else {
            None
        }
    }

    /// Forget failure history that has left the window and expired bans.
    /// Returns the number of IPs whose history was dropped.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        let before = self.failures.len();
        self.failures.retain(|_, failures| {
            prune(failures, cutoff);
            !failures.is_empty()
        });
        self.bans.retain(|_, ban| ban.expires_at > now);
        before.saturating_sub(self.failures.len())
    }

    /// IPs with failure history still held in memory
    pub fn tracked_ips(&self) -> usize {
        self.failures.len()
    }

    pub fn ban_at(&self, ip: &str, duration: Duration, now: DateTime<Utc>, manual: bool) -> Ban {
        let ban = Ban {
            ip: ip.to_string(),
            banned_at: now,
            expires_at: now + chrono_duration(duration),
            manual,
        };
        self.bans.insert(ip.to_string(), ban.clone());
        ban
    }

    /// Lift a ban and forget the IP's failure history
    pub fn unban(&self, ip: &str) -> bool {
        self.failures.remove(ip);
        self.bans.remove(ip).is_some()
    }

    pub fn active_bans_at(&self, now: DateTime<Utc>) -> Vec<Ban> {
        self.bans.retain(|_, ban| ban.expires_at > now);
        let mut bans: Vec<Ban> = self.bans.iter().map(|b| b.value().clone()).collect();
        bans.sort_by(|a, b| a.banned_at.cmp(&b.banned_at));
        bans
    }

    pub fn stats_at(&self, now: DateTime<Utc>, recent_limit: usize) -> AuditStats {
        let total = self.total.load(Ordering::Relaxed);
        let successful = self.successful.load(Ordering::Relaxed);
        let by_reason = self
            .by_reason
            .iter()
            .map(|e| (e.key().as_str().to_string(), *e.value()))
            .collect();
        let recent_attempts = self
            .recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .take(recent_limit)
            .cloned()
            .collect();

        AuditStats {
            total_attempts: total,
            successful,
            failed: total.saturating_sub(successful),
            by_reason,
            active_bans: self.active_bans_at(now),
            recent_attempts,
        }
    }
}
