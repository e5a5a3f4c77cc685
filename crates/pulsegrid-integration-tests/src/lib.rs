//! End-to-end integration tests for PulseGrid
//!
//! The tests under `tests/` bind a real server on loopback and drive it over
//! WebSockets and HTTP. Tests marked `#[ignore]` need Docker for TimescaleDB.

#[cfg(test)]
mod e2e_tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pulsegrid_observability::{Metrics, MonitorConfig, PerformanceMonitor};
    use pulsegrid_realtime::{
        AuthGateConfig, BroadcastHub, EventPipeline, MemorySessionCache, RealtimeAuthGate,
    };
    use pulsegrid_server::{AppState, build_router};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct NoUsers;

    #[async_trait::async_trait]
    impl pulsegrid_core::store::UserDirectory for NoUsers {
        async fn find_user(
            &self,
            _tenant_id: pulsegrid_core::TenantId,
            _user_id: pulsegrid_core::UserId,
        ) -> pulsegrid_core::Result<Option<pulsegrid_core::User>> {
            Ok(None)
        }
    }

    struct NoEvents;

    #[async_trait::async_trait]
    impl pulsegrid_core::store::EventStore for NoEvents {
        async fn record_event(
            &self,
            _tenant: &pulsegrid_core::TenantHandle,
            _event: pulsegrid_core::events::NewActivityEvent,
        ) -> pulsegrid_core::Result<pulsegrid_core::events::ActivityEvent> {
            Err(pulsegrid_core::Error::Connection("store offline".to_string()))
        }

        async fn query_events(
            &self,
            _tenant: &pulsegrid_core::TenantHandle,
            _query: &pulsegrid_core::events::EventQuery,
        ) -> pulsegrid_core::Result<Vec<pulsegrid_core::events::ActivityEvent>> {
            Ok(Vec::new())
        }
    }

    fn app() -> axum::Router {
        let metrics = Arc::new(Metrics::new().unwrap());
        let gate = RealtimeAuthGate::new(
            AuthGateConfig::new("lib-test-secret"),
            Arc::new(NoUsers),
            Arc::new(MemorySessionCache::new()),
        )
        .with_metrics(metrics.clone());
        let hub = BroadcastHub::default();
        let pipeline = EventPipeline::new(Arc::new(NoEvents), Arc::new(hub.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorConfig::default()));
        build_router(AppState::new(Arc::new(gate), pipeline, hub, monitor, metrics))
    }

    #[tokio::test]
    async fn test_api_refusal_carries_error_body() {
        let response = app()
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "NO_TOKEN");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exports_gate_counters() {
        let router = app();
        let _ = router
            .clone()
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pulsegrid_auth_rejections_total{reason=\"NO_TOKEN\"} 1"));
    }
}
