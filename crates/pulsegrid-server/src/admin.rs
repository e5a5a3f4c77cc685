//! Operator endpoints under `/admin`
//!
//! Every route requires a bearer token whose user holds `platform_operator`.
//! Tenant admins and owners are refused: these routes see every tenant.
//! Storage introspection answers 503 when the server runs without a database.

use axum::extract::{Path, Query, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use pulsegrid_core::{Error, Permission, TenantId};
use pulsegrid_realtime::error_response;
use pulsegrid_store_postgres::PartitionConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::app::{AppState, Storage, authorize, bad_request, storage_unavailable};

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/admin/partitions", get(list_partitions).post(create_partitions))
        .route("/admin/partitions/health", get(partition_health))
        .route("/admin/timeseries/hypertables", get(hypertables))
        .route("/admin/timeseries/chunks", get(chunks))
        .route("/admin/timeseries/compression", get(compression))
        .route("/admin/timeseries/aggregates", get(aggregates))
        .route("/admin/migrations", get(migration_status))
        .route("/admin/migrations/validate", get(validate_migrations))
        .route("/admin/policies", get(policy_status))
        .route("/admin/pool", get(pool_status))
        .route("/admin/auth/stats", get(auth_stats))
        .route("/admin/bans", post(ban_ip))
        .route("/admin/bans/{ip}", delete(unban_ip))
        .route("/admin/sessions/{session_id}", delete(logout_session))
        .route("/admin/performance", get(performance))
        .route("/admin/performance/history", get(performance_history))
        .route("/admin/performance/tenants", get(tenant_rollups))
        .route("/admin/performance/tenants/{tenant_id}", get(tenant_rollup))
        .route("/admin/alerts", get(alerts))
        .with_state(state)
}

fn respond<T: Serialize>(result: pulsegrid_core::Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn require_operator(
    state: &AppState,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Result<(), Response> {
    authorize(state, headers, extensions, Permission::PlatformOperator)
        .await
        .map(|_| ())
}

async fn admin_storage<'a>(
    state: &'a AppState,
    headers: &HeaderMap,
    extensions: &Extensions,
) -> Result<&'a Storage, Response> {
    require_operator(state, headers, extensions).await?;
    state.storage.as_deref().ok_or_else(storage_unavailable)
}

async fn list_partitions(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.partitions.list_partitions().await)
}

#[derive(Debug, Deserialize)]
struct CreatePartitionsParams {
    days: Option<u32>,
}

async fn create_partitions(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Query(params): Query<CreatePartitionsParams>,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };

    let days = match partition_days(params.days, storage.partitions.config()) {
        Ok(days) => days,
        Err(response) => return response,
    };
    match storage.partitions.pre_create_partitions(days).await {
        Ok(created) => {
            info!(created = created.len(), days, "Partitions pre-created via admin API");
            Json(created).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Requested horizon, or the configured one; above `max_days_ahead` is a 400
fn partition_days(requested: Option<u32>, config: &PartitionConfig) -> Result<u32, Response> {
    let days = requested.unwrap_or(config.days_ahead);
    if days > config.max_days_ahead {
        return Err(bad_request(format!(
            "days must be at most {}",
            config.max_days_ahead
        )));
    }
    Ok(days)
}

async fn partition_health(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    let days_ahead = storage.partitions.config().days_ahead;
    respond(storage.partitions.partition_health(days_ahead).await)
}

async fn hypertables(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.timeseries.hypertable_info().await)
}

async fn chunks(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.timeseries.chunk_info().await)
}

async fn compression(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.timeseries.compression_stats().await)
}

async fn aggregates(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.timeseries.aggregate_info().await)
}

async fn migration_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.migrations.status().await)
}

async fn validate_migrations(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.migrations.validate_migrations().await)
}

async fn policy_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    let storage = match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    respond(storage.policies.policy_status().await)
}

async fn pool_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    match admin_storage(&state, &headers, &extensions).await {
        Ok(storage) => Json(storage.gateway.pool_status()).into_response(),
        Err(response) => response,
    }
}

async fn auth_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    Json(state.gate.audit_stats()).into_response()
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    ip: String,
    /// Falls back to the configured ban duration
    duration_secs: Option<u64>,
}

async fn ban_ip(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Json(request): Json<BanRequest>,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    if request.ip.trim().is_empty() {
        return error_response(&Error::ConstraintViolation("ip must not be empty".to_string()));
    }

    let duration = request
        .duration_secs
        .map(Duration::from_secs)
        .unwrap_or(state.gate.config().ban_duration);
    let ban = state.gate.ban_ip(request.ip.trim(), duration);
    info!(ip = %ban.ip, "IP banned via admin API");
    (StatusCode::CREATED, Json(ban)).into_response()
}

async fn unban_ip(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Path(ip): Path<String>,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    if state.gate.unban_ip(&ip) {
        info!(ip = %ip, "IP unbanned via admin API");
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_response(&Error::NotFound(format!("no active ban for {}", ip)))
    }
}

async fn logout_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Path(session_id): Path<String>,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    match state.gate.logout(&session_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_response(&Error::NotFound("session not found".to_string())),
        Err(e) => error_response(&e),
    }
}

async fn performance(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    match state.monitor.latest_snapshot() {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(&Error::NotFound("no performance sample yet".to_string())),
    }
}

async fn performance_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    Json(state.monitor.history()).into_response()
}

async fn tenant_rollups(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    Json(state.monitor.tenant_rollups()).into_response()
}

async fn tenant_rollup(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
    Path(tenant_id): Path<TenantId>,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    match state.monitor.tenant_rollup(tenant_id) {
        Some(rollup) => Json(rollup).into_response(),
        None => error_response(&Error::NotFound(format!(
            "no live connections for tenant {}",
            tenant_id
        ))),
    }
}

async fn alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    extensions: Extensions,
) -> Response {
    if let Err(response) = require_operator(&state, &headers, &extensions).await {
        return response;
    }
    Json(state.monitor.alerts()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{SECRET, TestApp, body_json};
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use pulsegrid_core::Role;
    use pulsegrid_realtime::AuthGateConfig;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn get(uri: &str, token: &str) -> Request<Body> {
        Request::get(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_admin_routes_require_operator() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::ReadEvents, Permission::ViewMetrics]);

        let response = app
            .router()
            .oneshot(get("/admin/auth/stats", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_tenant_owner_is_refused_operator_routes() {
        let app = TestApp::new();
        let owner_permissions: Vec<Permission> =
            Role::Owner.default_permissions().into_iter().collect();
        let (_, token) = app.user(&owner_permissions);

        for uri in ["/admin/auth/stats", "/admin/performance/tenants", "/admin/alerts"] {
            let response = app.router().oneshot(get(uri, &token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", uri);
            assert_eq!(body_json(response).await["code"], "PERMISSION_DENIED");
        }

        app.state.gate.ban_ip("192.0.2.200", Duration::from_secs(60));
        let response = app
            .router()
            .oneshot(
                Request::delete("/admin/bans/192.0.2.200")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(app.state.gate.is_banned("192.0.2.200"));
    }

    #[tokio::test]
    async fn test_auth_stats() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);

        let response = app
            .router()
            .oneshot(get("/admin/auth/stats", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats = body_json(response).await;
        assert!(stats["total_attempts"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_storage_routes_without_database() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);

        for uri in [
            "/admin/partitions",
            "/admin/partitions/health",
            "/admin/timeseries/chunks",
            "/admin/migrations",
            "/admin/policies",
            "/admin/pool",
        ] {
            let response = app.router().oneshot(get(uri, &token)).await.unwrap();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_ban_and_unban() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);

        let response = app
            .router()
            .oneshot(
                Request::post("/admin/bans")
                    .header("authorization", format!("Bearer {}", token))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"ip":"203.0.113.9","duration_secs":600}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(app.state.gate.is_banned("203.0.113.9"));

        let delete = |uri: &str| {
            Request::delete(uri)
                .header("authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap()
        };
        let response = app
            .router()
            .oneshot(delete("/admin/bans/203.0.113.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!app.state.gate.is_banned("203.0.113.9"));

        let response = app
            .router()
            .oneshot(delete("/admin/bans/203.0.113.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_banned_peer_is_refused_despite_forwarding_header() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);
        app.state
            .gate
            .ban_ip("198.51.100.4", Duration::from_secs(600));

        let peer: SocketAddr = "198.51.100.4:40000".parse().unwrap();
        let response = app
            .router()
            .oneshot(
                Request::get("/admin/alerts")
                    .header("authorization", format!("Bearer {}", token))
                    .header("x-forwarded-for", "203.0.113.50")
                    .extension(ConnectInfo(peer))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(response).await["code"], "IP_BANNED");
    }

    #[tokio::test]
    async fn test_trusted_proxy_forwards_banned_client() {
        let proxy: SocketAddr = "10.0.0.1:8443".parse().unwrap();
        let app = TestApp::with_gate_config(
            AuthGateConfig::new(SECRET).with_trusted_proxies([proxy.ip()]),
        );
        let (_, token) = app.user(&[Permission::PlatformOperator]);
        app.state
            .gate
            .ban_ip("198.51.100.4", Duration::from_secs(600));

        let request = |forwarded_for: &'static str| {
            Request::get("/admin/alerts")
                .header("authorization", format!("Bearer {}", token))
                .header("x-forwarded-for", forwarded_for)
                .extension(ConnectInfo(proxy))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.router().oneshot(request("198.51.100.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app.router().oneshot(request("203.0.113.50")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_partition_days_are_capped() {
        let config = PartitionConfig::new().with_days_ahead(7).with_max_days_ahead(30);
        assert_eq!(partition_days(None, &config).ok(), Some(7));
        assert_eq!(partition_days(Some(30), &config).ok(), Some(30));

        let refused = partition_days(Some(31), &config).unwrap_err();
        assert_eq!(refused.status(), StatusCode::BAD_REQUEST);
        assert!(partition_days(Some(u32::MAX), &config).is_err());
    }

    #[tokio::test]
    async fn test_unknown_session_logout() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);

        let response = app
            .router()
            .oneshot(
                Request::delete("/admin/sessions/does-not-exist")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_performance_endpoints() {
        let app = TestApp::new();
        let (_, token) = app.user(&[Permission::PlatformOperator]);

        let response = app
            .router()
            .oneshot(get("/admin/performance", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let tenant = TenantId::new();
        app.state.monitor.register_connection("conn-1", tenant);
        app.state.monitor.sample();

        let response = app
            .router()
            .oneshot(get("/admin/performance", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["total_connections"], 1);

        let response = app
            .router()
            .oneshot(get(&format!("/admin/performance/tenants/{}", tenant), &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["connections"], 1);

        let response = app
            .router()
            .oneshot(get(
                &format!("/admin/performance/tenants/{}", TenantId::new()),
                &token,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .router()
            .oneshot(get("/admin/alerts", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await.is_array());
    }
}
