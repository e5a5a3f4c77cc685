//! Probe and scrape endpoints
//!
//! - `/healthz`: process liveness, never touches dependencies
//! - `/readyz`: 503 while the database or the shared session cache is unreachable
//! - `/metrics`: gateway registry plus any registries attached by the server

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::Metrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    /// `ready` or `not_ready`
    pub status: String,
    /// Absent when the server runs without external dependencies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReadinessResponse {
    fn from_components(components: Option<Vec<ComponentStatus>>) -> (StatusCode, Self) {
        let failing: Vec<&str> = components
            .iter()
            .flatten()
            .filter(|c| !c.healthy)
            .map(|c| c.name.as_str())
            .collect();

        if failing.is_empty() {
            return (
                StatusCode::OK,
                Self {
                    status: "ready".to_string(),
                    components,
                    message: None,
                },
            );
        }

        let message = format!("unavailable: {}", failing.join(", "));
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Self {
                status: "not_ready".to_string(),
                components,
                message: Some(message),
            },
        )
    }
}

/// Outcome of probing one dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentStatus {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// Probes the server's dependencies for `/readyz`
#[async_trait]
pub trait ReadinessChecker: Send + Sync {
    /// One status per dependency; ready means every entry is healthy
    async fn check(&self) -> Vec<ComponentStatus>;
}

#[derive(Clone)]
pub struct HealthState {
    pub metrics: Arc<Metrics>,
    /// Registries exported next to the gateway metrics (e.g. the store's)
    pub extra_registries: Vec<Registry>,
    pub readiness_checker: Option<Arc<dyn ReadinessChecker>>,
}

impl HealthState {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            extra_registries: Vec::new(),
            readiness_checker: None,
        }
    }

    pub fn with_readiness_checker(mut self, readiness_checker: Arc<dyn ReadinessChecker>) -> Self {
        self.readiness_checker = Some(readiness_checker);
        self
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.extra_registries.push(registry);
        self
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(liveness))
        .route("/readyz", get(readiness))
        .route("/metrics", get(scrape))
        .with_state(state)
}

async fn liveness() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: None,
    })
}

async fn readiness(State(state): State<HealthState>) -> Response {
    let components = match &state.readiness_checker {
        Some(checker) => Some(checker.check().await),
        None => None,
    };
    let (status, body) = ReadinessResponse::from_components(components);
    (status, Json(body)).into_response()
}

async fn scrape(State(state): State<HealthState>) -> Response {
    let mut families = state.metrics.registry().gather();
    for registry in &state.extra_registries {
        families.extend(registry.gather());
    }

    match TextEncoder::new().encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", PROMETHEUS_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", err),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use prometheus::IntCounter;
    use tower::ServiceExt;

    struct FixedDependencies {
        database: bool,
        cache: bool,
    }

    #[async_trait]
    impl ReadinessChecker for FixedDependencies {
        async fn check(&self) -> Vec<ComponentStatus> {
            let probe = |name: &str, up: bool| {
                if up {
                    ComponentStatus::healthy(name)
                } else {
                    ComponentStatus::unhealthy(name, "connection refused")
                }
            };
            vec![probe("database", self.database), probe("cache", self.cache)]
        }
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn state() -> HealthState {
        HealthState::new(Arc::new(Metrics::new().unwrap()))
    }

    #[tokio::test]
    async fn test_liveness_ignores_dependencies() {
        let router = health_router(state().with_readiness_checker(Arc::new(FixedDependencies {
            database: false,
            cache: false,
        })));
        let (status, body) = get(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"ok\""));
    }

    #[tokio::test]
    async fn test_ready_when_all_dependencies_answer() {
        let router = health_router(state().with_readiness_checker(Arc::new(FixedDependencies {
            database: true,
            cache: true,
        })));
        let (status, body) = get(router, "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        let parsed: ReadinessResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.status, "ready");
        assert_eq!(parsed.components.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_not_ready_names_failing_dependency() {
        let router = health_router(state().with_readiness_checker(Arc::new(FixedDependencies {
            database: true,
            cache: false,
        })));
        let (status, body) = get(router, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let parsed: ReadinessResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.status, "not_ready");
        assert_eq!(parsed.message.as_deref(), Some("unavailable: cache"));
    }

    #[tokio::test]
    async fn test_ready_without_checker_omits_components() {
        let (status, body) = get(health_router(state()), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.contains("components"));
    }

    #[tokio::test]
    async fn test_scrape_merges_attached_registries() {
        let health = state();
        health.metrics.record_auth_success();

        let store = Registry::new();
        let written = IntCounter::new("pulsegrid_events_written_total", "events").unwrap();
        store.register(Box::new(written.clone())).unwrap();
        written.inc();

        let response = health_router(health.with_registry(store))
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            PROMETHEUS_CONTENT_TYPE
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pulsegrid_auth_attempts_total"));
        assert!(text.contains("pulsegrid_events_written_total 1"));
    }
}
