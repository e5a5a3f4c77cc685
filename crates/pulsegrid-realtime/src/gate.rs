//! WebSocket connection authentication and per-message authorization
//!
//! `authenticate` walks a fixed sequence of checks:
//!
//! 1. IP ban
//! 2. handshake rate limit per IP
//! 3. token extraction
//! 4. token verification
//! 5. user lookup
//! 6. per-user connection limit
//! 7. session creation
//!
//! The first failing check refuses the connection with its reason code.
//! Every outcome is audited and failed attempts feed abuse detection.

use chrono::{DateTime, Utc};
use pulsegrid_core::auth::{AuthRejection, ConnectionAttempt, RejectReason, Session};
use pulsegrid_core::cache::{SessionCache, rate_limit_key};
use pulsegrid_core::store::{AuditSink, NoopAuditSink, UserDirectory};
use pulsegrid_core::{Error, Permission, Result, TenantHandle, TenantId, User, UserId};
use pulsegrid_observability::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::abuse::{AbuseTracker, AuditStats, Ban};
use crate::config::AuthGateConfig;
use crate::handshake::Handshake;
use crate::rate_limit::MessageRateLimiter;
use crate::token::TokenVerifier;

/// Recent attempts included in `audit_stats`
const RECENT_ATTEMPTS_IN_STATS: usize = 100;

/// Identity and per-socket state of an accepted connection
#[derive(Debug)]
pub struct AuthenticatedConnection {
    pub session: Session,
    pub user: User,
    limiter: MessageRateLimiter,
    connected_at: DateTime<Utc>,
    events_published: u64,
}

impl AuthenticatedConnection {
    pub fn tenant_id(&self) -> TenantId {
        self.session.tenant_id
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Write handle for the connection's tenant
    pub fn handle(&self) -> TenantHandle {
        TenantHandle::new(self.tenant_id())
    }

    pub fn read_handle(&self) -> TenantHandle {
        TenantHandle::read_only(self.tenant_id())
    }

    /// Count one published event, returning the running total
    pub fn record_event_published(&mut self) -> u64 {
        self.events_published += 1;
        self.events_published
    }

    pub fn events_published(&self) -> u64 {
        self.events_published
    }
}

enum HandshakeFailure {
    Rejected {
        rejection: AuthRejection,
        identity: Option<(TenantId, UserId)>,
    },
    Infrastructure(Error),
}

impl From<Error> for HandshakeFailure {
    fn from(e: Error) -> Self {
        HandshakeFailure::Infrastructure(e)
    }
}

fn refuse(reason: RejectReason, message: impl Into<String>) -> HandshakeFailure {
    HandshakeFailure::Rejected {
        rejection: AuthRejection::new(reason, message),
        identity: None,
    }
}

fn new_session_id() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

pub struct RealtimeAuthGate {
    config: AuthGateConfig,
    verifier: TokenVerifier,
    directory: Arc<dyn UserDirectory>,
    cache: Arc<dyn SessionCache>,
    audit: Arc<dyn AuditSink>,
    tracker: AbuseTracker,
    metrics: Option<Arc<Metrics>>,
}

impl RealtimeAuthGate {
    pub fn new(
        config: AuthGateConfig,
        directory: Arc<dyn UserDirectory>,
        cache: Arc<dyn SessionCache>,
    ) -> Self {
        let verifier = TokenVerifier::new(&config.jwt_secret, config.refresh_secret.as_deref());
        let tracker = AbuseTracker::new(&config);
        Self {
            config,
            verifier,
            directory,
            cache,
            audit: Arc::new(NoopAuditSink),
            tracker,
            metrics: None,
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &AuthGateConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn SessionCache> {
        &self.cache
    }

    pub async fn authenticate(&self, handshake: &Handshake) -> Result<AuthenticatedConnection> {
        self.authenticate_at(handshake, Utc::now()).await
    }

    /// Run the handshake checks. Refusals come back as `Error::AuthRejected`;
    /// cache and directory failures propagate unaudited.
    pub async fn authenticate_at(
        &self,
        handshake: &Handshake,
        now: DateTime<Utc>,
    ) -> Result<AuthenticatedConnection> {
        let fingerprint = handshake.fingerprint();
        match self.run_checks(handshake, &fingerprint, now).await {
            Ok(conn) => {
                self.record_attempt(
                    handshake,
                    &fingerprint,
                    now,
                    None,
                    Some((conn.tenant_id(), conn.user_id())),
                )
                .await;
                info!(
                    ip = %handshake.ip,
                    tenant_id = %conn.tenant_id(),
                    user_id = %conn.user_id(),
                    session_id = %conn.session_id(),
                    "Connection authenticated"
                );
                Ok(conn)
            }
            Err(HandshakeFailure::Rejected {
                rejection,
                identity,
            }) => {
                warn!(
                    ip = %handshake.ip,
                    reason = %rejection.reason,
                    message = %rejection.message,
                    "Connection rejected"
                );
                self.record_attempt(
                    handshake,
                    &fingerprint,
                    now,
                    Some(rejection.reason),
                    identity,
                )
                .await;
                Err(Error::AuthRejected(rejection))
            }
            Err(HandshakeFailure::Infrastructure(e)) => Err(e),
        }
    }

    async fn run_checks(
        &self,
        handshake: &Handshake,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<AuthenticatedConnection, HandshakeFailure> {
        if let Some(expires_at) = self.tracker.ban_expiry_at(&handshake.ip, now) {
            return Err(refuse(
                RejectReason::IpBanned,
                format!("ip banned until {}", expires_at.to_rfc3339()),
            ));
        }

        let window = self
            .cache
            .incr_window(&rate_limit_key(&handshake.ip), self.config.handshake_window)
            .await?;
        if window.count > self.config.handshake_limit {
            return Err(refuse(
                RejectReason::RateLimited,
                format!(
                    "too many connection attempts, retry after {}",
                    window.reset_at.to_rfc3339()
                ),
            ));
        }

        let Some(token) = handshake.token() else {
            return Err(refuse(RejectReason::NoToken, "no token provided"));
        };

        let verified = self
            .verifier
            .verify(token)
            .map_err(|rejection| HandshakeFailure::Rejected {
                rejection,
                identity: None,
            })?;
        let identity = Some((verified.tenant_id, verified.user_id));

        let user = match self
            .directory
            .find_user(verified.tenant_id, verified.user_id)
            .await?
        {
            Some(user) if user.is_active => user,
            Some(_) => {
                return Err(HandshakeFailure::Rejected {
                    rejection: AuthRejection::new(
                        RejectReason::UserInactive,
                        format!("user {} is inactive", verified.user_id),
                    ),
                    identity,
                });
            }
            None => {
                return Err(HandshakeFailure::Rejected {
                    rejection: AuthRejection::new(
                        RejectReason::UserNotFound,
                        format!(
                            "user {} not found in tenant {}",
                            verified.user_id, verified.tenant_id
                        ),
                    ),
                    identity,
                });
            }
        };

        let count = self
            .cache
            .incr_connections(user.id, self.config.session_ttl)
            .await?;
        if count > self.config.max_connections_per_user {
            self.cache.decr_connections(user.id).await?;
            return Err(HandshakeFailure::Rejected {
                rejection: AuthRejection::new(
                    RejectReason::ConnectionLimit,
                    format!(
                        "maximum of {} connections reached",
                        self.config.max_connections_per_user
                    ),
                ),
                identity,
            });
        }

        let session = Session {
            session_id: new_session_id(),
            user_id: user.id,
            tenant_id: user.tenant_id,
            ip_address: handshake.ip.clone(),
            user_agent: handshake.user_agent.clone(),
            fingerprint: fingerprint.to_string(),
            socket_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity: now,
            ttl_secs: self.config.session_ttl.as_secs().max(1),
        };
        if let Err(e) = self.cache.put_session(&session).await {
            // Release the slot taken above
            if let Err(decr_err) = self.cache.decr_connections(user.id).await {
                warn!(user_id = %user.id, error = %decr_err, "Failed to release connection slot");
            }
            return Err(e.into());
        }

        Ok(AuthenticatedConnection {
            session,
            user,
            limiter: MessageRateLimiter::new(
                self.config.message_limit,
                self.config.message_window,
                now,
            ),
            connected_at: now,
            events_published: 0,
        })
    }

    async fn record_attempt(
        &self,
        handshake: &Handshake,
        fingerprint: &str,
        now: DateTime<Utc>,
        reason: Option<RejectReason>,
        identity: Option<(TenantId, UserId)>,
    ) {
        let attempt = ConnectionAttempt {
            ip: handshake.ip.clone(),
            user_agent: handshake.user_agent.clone(),
            timestamp: now,
            success: reason.is_none(),
            reason,
            fingerprint: fingerprint.to_string(),
            tenant_id: identity.map(|(tenant_id, _)| tenant_id),
            user_id: identity.map(|(_, user_id)| user_id),
        };

        if let Some(ban) = self.tracker.record_at(&attempt, now) {
            warn!(
                ip = %ban.ip,
                expires_at = %ban.expires_at,
                "IP banned after repeated failed attempts"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_ip_ban();
            }
        }

        if let Some(metrics) = &self.metrics {
            match reason {
                Some(reason) => metrics.record_auth_rejection(reason.as_str()),
                None => metrics.record_auth_success(),
            }
        }

        if let Err(e) = self.audit.record_attempt(&attempt).await {
            warn!(ip = %attempt.ip, error = %e, "Failed to persist connection attempt");
        }
    }

    pub async fn authorize_request(
        &self,
        conn: &mut AuthenticatedConnection,
        permission: Option<Permission>,
    ) -> Result<()> {
        self.authorize_request_at(conn, permission, Utc::now()).await
    }

    /// Per-message check: connection rate window, session liveness, permission.
    /// A throttled message is refused without closing the connection.
    pub async fn authorize_request_at(
        &self,
        conn: &mut AuthenticatedConnection,
        permission: Option<Permission>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Err(throttled) = conn.limiter.check_at(now) {
            debug!(
                session_id = %conn.session_id(),
                retry_after_ms = throttled.retry_after_ms,
                "Message throttled"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_throttled();
            }
            return Err(Error::RateLimitExceeded {
                retry_after_ms: throttled.retry_after_ms,
                reset_at: throttled.reset_at,
            });
        }

        if !self.cache.touch_session(conn.session_id(), now).await? {
            return Err(Error::AuthRejected(AuthRejection::new(
                RejectReason::InvalidToken,
                "session expired",
            )));
        }
        conn.session.last_activity = now;

        match permission {
            Some(permission) => self.require_permission(conn, permission),
            None => Ok(()),
        }
    }

    /// Permission check alone, for frames already charged to the rate window
    pub fn require_permission(
        &self,
        conn: &AuthenticatedConnection,
        permission: Permission,
    ) -> Result<()> {
        if conn.user.has_permission(permission) {
            Ok(())
        } else {
            Err(Error::Permission(format!(
                "missing permission {}",
                permission.as_str()
            )))
        }
    }

    /// Verify a bearer token for a plain HTTP request. No session is created,
    /// but refusals are audited like socket handshakes.
    pub async fn authenticate_bearer(&self, handshake: &Handshake) -> Result<User> {
        let now = Utc::now();
        let fingerprint = handshake.fingerprint();
        let outcome = self.verify_bearer(handshake, now).await;
        match outcome {
            Ok(user) => {
                self.record_attempt(
                    handshake,
                    &fingerprint,
                    now,
                    None,
                    Some((user.tenant_id, user.id)),
                )
                .await;
                Ok(user)
            }
            Err(HandshakeFailure::Rejected {
                rejection,
                identity,
            }) => {
                warn!(ip = %handshake.ip, reason = %rejection.reason, "Request rejected");
                self.record_attempt(
                    handshake,
                    &fingerprint,
                    now,
                    Some(rejection.reason),
                    identity,
                )
                .await;
                Err(Error::AuthRejected(rejection))
            }
            Err(HandshakeFailure::Infrastructure(e)) => Err(e),
        }
    }

    async fn verify_bearer(
        &self,
        handshake: &Handshake,
        now: DateTime<Utc>,
    ) -> std::result::Result<User, HandshakeFailure> {
        if self.tracker.ban_expiry_at(&handshake.ip, now).is_some() {
            return Err(refuse(RejectReason::IpBanned, "ip banned"));
        }
        let Some(token) = handshake.token() else {
            return Err(refuse(RejectReason::NoToken, "no token provided"));
        };
        let verified = self
            .verifier
            .verify(token)
            .map_err(|rejection| HandshakeFailure::Rejected {
                rejection,
                identity: None,
            })?;
        let identity = Some((verified.tenant_id, verified.user_id));
        match self
            .directory
            .find_user(verified.tenant_id, verified.user_id)
            .await?
        {
            Some(user) if user.is_active => Ok(user),
            Some(_) => Err(HandshakeFailure::Rejected {
                rejection: AuthRejection::new(RejectReason::UserInactive, "user is inactive"),
                identity,
            }),
            None => Err(HandshakeFailure::Rejected {
                rejection: AuthRejection::new(RejectReason::UserNotFound, "user not found"),
                identity,
            }),
        }
    }

    /// Release the connection's session and its per-user slot
    pub async fn disconnect(&self, conn: &AuthenticatedConnection) -> Result<()> {
        self.release(&conn.session).await
    }

    /// Same as `disconnect`, for callers that only kept the session
    pub async fn release(&self, session: &Session) -> Result<()> {
        self.cache.remove_session(&session.session_id).await?;
        let remaining = self.cache.decr_connections(session.user_id).await?;
        debug!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            remaining,
            "Connection released"
        );
        Ok(())
    }

    /// Remove a session by ID. A socket still using it is refused on its next
    /// message and releases its slot when it closes.
    pub async fn logout(&self, session_id: &str) -> Result<bool> {
        let removed = self.cache.remove_session(session_id).await?;
        if let Some(session) = &removed {
            info!(session_id, user_id = %session.user_id, "Session logged out");
        }
        Ok(removed.is_some())
    }

    pub fn ban_ip(&self, ip: &str, duration: Duration) -> Ban {
        let ban = self.tracker.ban_at(ip, duration, Utc::now(), true);
        info!(ip, expires_at = %ban.expires_at, "IP banned manually");
        if let Some(metrics) = &self.metrics {
            metrics.record_ip_ban();
        }
        ban
    }

    pub fn unban_ip(&self, ip: &str) -> bool {
        let lifted = self.tracker.unban(ip);
        if lifted {
            info!(ip, "IP ban lifted");
        }
        lifted
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.tracker.ban_expiry_at(ip, Utc::now()).is_some()
    }

    pub fn audit_stats(&self) -> AuditStats {
        self.tracker.stats_at(Utc::now(), RECENT_ATTEMPTS_IN_STATS)
    }

    /// Drop abuse history that has aged out of the window, and lapsed bans
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let dropped = self.tracker.sweep_at(now);
        if dropped > 0 {
            debug!(dropped, tracked = self.tracker.tracked_ips(), "Swept abuse history");
        }
        dropped
    }

    pub fn tracked_ips(&self) -> usize {
        self.tracker.tracked_ips()
    }
}

/// Handle for the background abuse-history sweep
pub struct SweepTask {
    shutdown_tx: tokio::sync::mpsc::Sender<()>,
}

impl SweepTask {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Sweep the gate's abuse history once per abuse window
pub fn spawn_sweep_task(gate: Arc<RealtimeAuthGate>) -> SweepTask {
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

    tokio::spawn(async move {
        let interval = gate.config.abuse_window;
        info!(interval_secs = interval.as_secs(), "Starting abuse history sweep");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Abuse history sweep shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    gate.sweep_at(Utc::now());
                }
            }
        }
    });

    SweepTask { shutdown_tx }
}
