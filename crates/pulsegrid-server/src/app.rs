//! HTTP application: shared state, the tenant API and router assembly

use async_trait::async_trait;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use pulsegrid_core::events::{EventQuery, NewActivityEvent};
use pulsegrid_core::{Error, Permission, TenantHandle, User};
use pulsegrid_observability::{
    ComponentStatus, HealthState, Metrics, PerformanceMonitor, ReadinessChecker, health_router,
};
use pulsegrid_realtime::{
    BroadcastHub, ErrorBody, EventPipeline, Handshake, RealtimeAuthGate, RealtimeState,
    RedisSessionCache, error_response, realtime_router,
};
use pulsegrid_store_postgres::{
    ConnectionGateway, Granularity, MigrationManager, PartitionManager, PolicyEngine, RollupQuery,
    TimeSeriesManager,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::admin::admin_router;
use crate::config::ServerConfig;

/// Database-backed managers, present when the server runs against PostgreSQL
pub struct Storage {
    pub gateway: ConnectionGateway,
    pub migrations: MigrationManager,
    pub timeseries: TimeSeriesManager,
    pub partitions: Arc<PartitionManager>,
    pub policies: PolicyEngine,
}

impl Storage {
    pub fn new(gateway: ConnectionGateway, config: &ServerConfig) -> pulsegrid_core::Result<Self> {
        let pool = gateway.pool().clone();
        let mut partitions = PartitionManager::new(pool.clone(), config.partition_config())?;
        if let Some(metrics) = gateway.metrics() {
            partitions = partitions.with_metrics(metrics.clone());
        }
        let mut migrations = MigrationManager::new(pool.clone(), &config.migrations.directory);
        if let Some(metrics) = gateway.metrics() {
            migrations = migrations.with_metrics(metrics.clone());
        }

        Ok(Self {
            timeseries: TimeSeriesManager::new(gateway.clone(), config.timeseries_config()),
            policies: PolicyEngine::new(pool),
            partitions: Arc::new(partitions),
            migrations,
            gateway,
        })
    }
}

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<RealtimeAuthGate>,
    pub pipeline: EventPipeline,
    pub hub: BroadcastHub,
    pub monitor: Arc<PerformanceMonitor>,
    pub metrics: Arc<Metrics>,
    pub storage: Option<Arc<Storage>>,
    pub readiness: Option<Arc<dyn ReadinessChecker>>,
}

impl AppState {
    pub fn new(
        gate: Arc<RealtimeAuthGate>,
        pipeline: EventPipeline,
        hub: BroadcastHub,
        monitor: Arc<PerformanceMonitor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gate,
            pipeline,
            hub,
            monitor,
            metrics,
            storage: None,
            readiness: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_readiness_checker(mut self, checker: Arc<dyn ReadinessChecker>) -> Self {
        self.readiness = Some(checker);
        self
    }

    fn realtime_state(&self) -> RealtimeState {
        RealtimeState::new(self.gate.clone(), self.pipeline.clone(), self.hub.clone())
            .with_monitor(self.monitor.clone())
            .with_metrics(self.metrics.clone())
    }

    fn health_state(&self) -> HealthState {
        let mut health = HealthState::new(self.metrics.clone());
        if let Some(checker) = &self.readiness {
            health = health.with_readiness_checker(checker.clone());
        }
        if let Some(store_metrics) = self
            .storage
            .as_ref()
            .and_then(|storage| storage.gateway.metrics())
        {
            health = health.with_registry(store_metrics.registry().clone());
        }
        health
    }
}

/// Assemble every route: `/ws`, `/api/*`, `/admin/*` and the health endpoints
pub fn build_router(state: AppState) -> Router {
    let realtime = realtime_router(state.realtime_state());
    let health = health_router(state.health_state());

    Router::new()
        .merge(api_router(state.clone()))
        .merge(admin_router(state))
        .merge(realtime)
        .merge(health)
        .layer(TraceLayer::new_for_http())
}

fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", get(list_events).post(create_event))
        .route("/api/rollups", get(get_rollups))
        .with_state(state)
}

/// Verify the bearer token and require `permission`. Tenant admins pass every
/// tenant-scoped check; platform-scoped permissions must be held explicitly.
pub(crate) async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    extensions: &Extensions,
    permission: Permission,
) -> Result<User, Response> {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let handshake =
        Handshake::from_request(headers, None, peer, &state.gate.config().trusted_proxies);

    let user = state
        .gate
        .authenticate_bearer(&handshake)
        .await
        .map_err(|e| error_response(&e))?;
    if !user.has_permission(permission) {
        return Err(error_response(&Error::Permission(format!(
            "missing permission {}",
            permission.as_str()
        ))));
    }
    Ok(user)
}

pub(crate) fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            code: "BAD_REQUEST".to_string(),
            message: message.into(),
        }),
    )
        .into_response()
}

pub(crate) fn storage_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorBody {
            code: "STORAGE_UNAVAILABLE".to_string(),
            message: "storage is not configured".to_string(),
        }),
    )
        .into_response()
}

async fn list_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(query): Query<EventQuery>,
) -> Response {
    let user = match authorize(&state, &headers, &extensions, Permission::ReadEvents).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    match state
        .pipeline
        .query(&TenantHandle::read_only(user.tenant_id), &query)
        .await
    {
        Ok(events) => Json(events).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(mut event): Json<NewActivityEvent>,
) -> Response {
    let user = match authorize(&state, &headers, &extensions, Permission::WriteEvents).await {
        Ok(user) => user,
        Err(response) => return response,
    };

    event.user_id = Some(user.id);
    match state
        .pipeline
        .submit(&TenantHandle::new(user.tenant_id), event)
        .await
    {
        Ok(stored) => (StatusCode::CREATED, Json(stored)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct RollupParams {
    #[serde(default = "default_granularity")]
    granularity: String,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    event_type: Option<String>,
}

fn default_granularity() -> String {
    "hourly".to_string()
}

impl RollupParams {
    /// Defaults to the last day ending now
    fn into_query(self, now: DateTime<Utc>) -> pulsegrid_core::Result<RollupQuery> {
        let granularity: Granularity = self.granularity.parse()?;
        let until = self.until.unwrap_or(now);
        let since = self.since.unwrap_or(until - ChronoDuration::days(1));
        if since >= until {
            return Err(Error::ConstraintViolation(
                "since must be earlier than until".to_string(),
            ));
        }
        Ok(RollupQuery {
            granularity,
            since,
            until,
            event_type: self.event_type,
        })
    }
}

async fn get_rollups(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<RollupParams>,
) -> Response {
    let user = match authorize(&state, &headers, &extensions, Permission::ReadEvents).await {
        Ok(user) => user,
        Err(response) => return response,
    };
    let Some(storage) = &state.storage else {
        return storage_unavailable();
    };

    let query = match params.into_query(Utc::now()) {
        Ok(query) => query,
        Err(e) => return error_response(&e),
    };
    match storage
        .timeseries
        .query_rollup(&TenantHandle::read_only(user.tenant_id), &query)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

/// Readiness: the database answers a ping and the shared cache answers PING
pub struct ServiceReadiness {
    gateway: Option<ConnectionGateway>,
    redis: Option<Arc<RedisSessionCache>>,
}

impl ServiceReadiness {
    pub fn new(gateway: Option<ConnectionGateway>, redis: Option<Arc<RedisSessionCache>>) -> Self {
        Self { gateway, redis }
    }
}

#[async_trait]
impl ReadinessChecker for ServiceReadiness {
    async fn check(&self) -> Vec<ComponentStatus> {
        let mut components = Vec::new();
        if let Some(gateway) = &self.gateway {
            components.push(match gateway.ping().await {
                Ok(()) => ComponentStatus::healthy("database"),
                Err(e) => ComponentStatus::unhealthy("database", e.to_string()),
            });
        }
        if let Some(redis) = &self.redis {
            components.push(match redis.ping().await {
                Ok(()) => ComponentStatus::healthy("cache"),
                Err(e) => ComponentStatus::unhealthy("cache", e.to_string()),
            });
        }
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestApp, body_json};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_rollup_params_default_window() {
        let now = Utc::now();
        let query = RollupParams {
            granularity: "daily".to_string(),
            since: None,
            until: None,
            event_type: None,
        }
        .into_query(now)
        .unwrap();
        assert_eq!(query.granularity, Granularity::Daily);
        assert_eq!(query.until, now);
        assert_eq!(query.since, now - ChronoDuration::days(1));
    }

    #[test]
    fn test_rollup_params_rejects_bad_input() {
        let now = Utc::now();
        let bad_granularity = RollupParams {
            granularity: "monthly".to_string(),
            since: None,
            until: None,
            event_type: None,
        };
        assert!(bad_granularity.into_query(now).is_err());

        let inverted = RollupParams {
            granularity: "hourly".to_string(),
            since: Some(now),
            until: Some(now - ChronoDuration::hours(1)),
            event_type: None,
        };
        assert!(matches!(
            inverted.into_query(now),
            Err(Error::ConstraintViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_events_require_bearer_token() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "NO_TOKEN");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_create_then_list_events() {
        let app = TestApp::new();
        let (user, token) = app.user(&[Permission::ReadEvents, Permission::WriteEvents]);

        let response = app
            .router()
            .oneshot(
                Request::post("/api/events")
                    .header("authorization", format!("Bearer {}", token))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_id":null,"event_type":"page_view","value":2.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["tenant_id"], user.tenant_id.to_string());
        assert_eq!(created["user_id"], user.id.to_string());

        let response = app
            .router()
            .oneshot(
                Request::get("/api/events?event_type=page_view")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let events = body_json(response).await;
        assert_eq!(events.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_are_tenant_scoped() {
        let app = TestApp::new();
        let (_, writer) = app.user(&[Permission::WriteEvents]);
        let (_, reader) = app.user(&[Permission::ReadEvents]);

        let response = app
            .router()
            .oneshot(
                Request::post("/api/events")
                    .header("authorization", format!("Bearer {}", writer))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_id":null,"event_type":"click"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .router()
            .oneshot(
                Request::get("/api/events")
                    .header("authorization", format!("Bearer {}", reader))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let events = body_json(response).await;
        assert!(events.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_requires_permission() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::ReadEvents]);

        let response = app
            .router()
            .oneshot(
                Request::post("/api/events")
                    .header("authorization", format!("Bearer {}", token))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"user_id":null,"event_type":"click"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "PERMISSION_DENIED");
    }

    #[tokio::test]
    async fn test_rollups_without_storage() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::ReadEvents]);

        let response = app
            .router()
            .oneshot(
                Request::get("/api/rollups?granularity=hourly")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "STORAGE_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_health_routes_are_mounted() {
        let app = TestApp::new();
        let response = app
            .router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .router()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
