//! Fixed-window message limiter owned by each connection

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Refusal from the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    pub reset_at: DateTime<Utc>,
    pub retry_after_ms: u64,
}

/// Counts messages in fixed windows. Refused messages do not consume quota.
#[derive(Debug, Clone)]
pub struct MessageRateLimiter {
    limit: u32,
    window: chrono::Duration,
    count: u32,
    window_start: DateTime<Utc>,
}

impl MessageRateLimiter {
    pub fn new(limit: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            limit,
            window: chrono::Duration::milliseconds(window.as_millis().min(i64::MAX as u128) as i64),
            count: 0,
            window_start: now,
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }

    /// Admit one message, returning how many remain in the window
    pub fn check_at(&mut self, now: DateTime<Utc>) -> Result<u32, Throttled> {
        if now >= self.reset_at() {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit {
            let reset_at = self.reset_at();
            return Err(Throttled {
                reset_at,
                retry_after_ms: (reset_at - now).num_milliseconds().max(0) as u64,
            });
        }
        self.count += 1;
        Ok(self.limit - self.count)
    }
}
