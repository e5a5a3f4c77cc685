//! Mapping of sqlx errors onto the PulseGrid error taxonomy, plus the
//! bounded retry helper for transient failures.

use pulsegrid_core::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Classify a sqlx error by SQLSTATE
///
/// `context` names the operation and is prefixed to the message.
pub fn classify(err: sqlx::Error, context: &str) -> Error {
    match err {
        sqlx::Error::PoolTimedOut => Error::Connection(format!("{}: pool timed out", context)),
        sqlx::Error::PoolClosed => Error::Connection(format!("{}: pool closed", context)),
        sqlx::Error::Io(e) => Error::Connection(format!("{}: {}", context, e)),
        sqlx::Error::Tls(e) => Error::Connection(format!("{}: {}", context, e)),
        sqlx::Error::RowNotFound => Error::NotFound(format!("{}: row not found", context)),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = format!("{}: {}", context, db.message());
            classify_sqlstate(&code, message)
        }
        other => Error::Database(format!("{}: {}", context, other)),
    }
}

/// Map a SQLSTATE code onto an error variant
pub fn classify_sqlstate(code: &str, message: String) -> Error {
    match code {
        // insufficient_privilege; also raised for RLS WITH CHECK failures
        "42501" => Error::Permission(message),
        // query_canceled (statement_timeout), lock_not_available
        "57014" | "55P03" => Error::Timeout(message),
        // admin/crash shutdown, cannot connect now
        "57P01" | "57P02" | "57P03" => Error::Connection(message),
        c if c.starts_with("08") => Error::Connection(message),
        c if c.starts_with("23") => Error::ConstraintViolation(message),
        _ => Error::Database(message),
    }
}

/// Backoff policy for `retry_transient`
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential with up to 50% jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_ms = (capped.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter)
    }
}

/// Re-run `op` while it fails with a retryable error, up to `max_attempts`
/// total attempts. Non-retryable errors are returned immediately.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient database error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classify_pool_errors_as_connection() {
        assert!(matches!(
            classify(sqlx::Error::PoolTimedOut, "acquire"),
            Error::Connection(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::PoolClosed, "acquire"),
            Error::Connection(_)
        ));
        assert!(matches!(
            classify(sqlx::Error::RowNotFound, "lookup"),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_classify_sqlstate() {
        assert!(matches!(
            classify_sqlstate("23505", "dup".into()),
            Error::ConstraintViolation(_)
        ));
        assert!(matches!(
            classify_sqlstate("23503", "fk".into()),
            Error::ConstraintViolation(_)
        ));
        assert!(matches!(
            classify_sqlstate("42501", "rls".into()),
            Error::Permission(_)
        ));
        assert!(matches!(
            classify_sqlstate("57014", "timeout".into()),
            Error::Timeout(_)
        ));
        assert!(matches!(
            classify_sqlstate("08006", "gone".into()),
            Error::Connection(_)
        ));
        assert!(matches!(
            classify_sqlstate("42P01", "no table".into()),
            Error::Database(_)
        ));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
        };
        assert!(policy.delay_for(1) >= Duration::from_millis(100));
        assert!(policy.delay_for(8) <= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let c = Arc::clone(&calls);
        let result = retry_transient(&policy, || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Connection("reset".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_never_retries_permission_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<()> = retry_transient(&RetryPolicy::default(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Permission("denied".to_string()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Permission(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let c = Arc::clone(&calls);
        let result: Result<()> = retry_transient(&policy, || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::Timeout("slow".to_string()))
            }
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
