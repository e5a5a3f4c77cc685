//! Common test utilities for integration tests

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pulsegrid_core::events::{ActivityEvent, EventQuery, NewActivityEvent};
use pulsegrid_core::store::{EventStore, UserDirectory};
use pulsegrid_core::{Permission, Result, Role, TenantHandle, TenantId, User, UserId};
use pulsegrid_observability::{Metrics, MonitorConfig, PerformanceMonitor};
use pulsegrid_realtime::{
    AuthGateConfig, BroadcastHub, ClientMessage, EventPipeline, MemorySessionCache,
    RealtimeAuthGate, ServerMessage, TokenClaims,
};
use pulsegrid_server::{AppState, build_router};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[allow(dead_code)]
pub const SECRET: &str = "integration-test-secret";

#[allow(dead_code)]
pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// In-memory user directory for testing
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryDirectory {
    users: Mutex<HashMap<UserId, User>>,
}

#[allow(dead_code)]
impl InMemoryDirectory {
    pub fn insert(&self, user: User) {
        self.users.lock().unwrap().insert(user.id, user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_user(&self, tenant_id: TenantId, user_id: UserId) -> Result<Option<User>> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .get(&user_id)
            .filter(|u| u.tenant_id == tenant_id)
            .cloned())
    }
}

/// In-memory event store for testing
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<ActivityEvent>>,
}

#[allow(dead_code)]
impl InMemoryEventStore {
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record_event(
        &self,
        tenant: &TenantHandle,
        event: NewActivityEvent,
    ) -> Result<ActivityEvent> {
        let stored = event.into_event(tenant.require_tenant()?, Utc::now());
        self.events.lock().unwrap().push(stored.clone());
        Ok(stored)
    }

    async fn query_events(
        &self,
        tenant: &TenantHandle,
        query: &EventQuery,
    ) -> Result<Vec<ActivityEvent>> {
        let tenant_id = tenant.require_tenant()?;
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id && query.matches(e))
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }
}

/// A server bound to an ephemeral port on loopback
#[allow(dead_code)]
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub directory: Arc<InMemoryDirectory>,
    pub store: Arc<InMemoryEventStore>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(AuthGateConfig::new(SECRET)).await
    }

    pub async fn start_with(config: AuthGateConfig) -> Self {
        let directory = Arc::new(InMemoryDirectory::default());
        let store = Arc::new(InMemoryEventStore::default());
        let metrics = Arc::new(Metrics::new().unwrap());

        let gate = RealtimeAuthGate::new(
            config,
            directory.clone(),
            Arc::new(MemorySessionCache::new()),
        )
        .with_metrics(metrics.clone());
        let hub = BroadcastHub::default();
        let pipeline = EventPipeline::new(store.clone(), Arc::new(hub.clone()))
            .with_metrics(metrics.clone());
        let monitor = Arc::new(
            PerformanceMonitor::new(MonitorConfig::default()).with_metrics(metrics.clone()),
        );
        let state = AppState::new(Arc::new(gate), pipeline, hub, monitor, metrics);

        let addr = spawn_server(state.clone()).await;
        Self {
            addr,
            state,
            directory,
            store,
        }
    }

    /// Register an active user and return it with a signed access token
    pub fn user(&self, tenant_id: TenantId, permissions: &[Permission]) -> (User, String) {
        let user = User {
            id: UserId::new(),
            tenant_id,
            email: format!("{}@example.com", uuid::Uuid::new_v4()),
            role: Role::Member,
            permissions: permissions.iter().copied().collect(),
            is_active: true,
        };
        self.directory.insert(user.clone());
        (user.clone(), token_for(&user))
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// Connect and consume the welcome message
    pub async fn connect(&self, token: &str) -> (Socket, ServerMessage) {
        let (mut socket, _) = tokio_tungstenite::connect_async(self.ws_url(token))
            .await
            .expect("handshake should succeed");
        let welcome = next_message(&mut socket).await;
        assert_eq!(welcome.kind(), "welcome");
        (socket, welcome)
    }
}

/// Serve the full router on an ephemeral loopback port
#[allow(dead_code)]
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state);

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[allow(dead_code)]
pub fn token_for(user: &User) -> String {
    TokenClaims::access(user.id, user.tenant_id, Duration::from_secs(3600))
        .sign(SECRET)
        .unwrap()
}

#[allow(dead_code)]
pub async fn send(socket: &mut Socket, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    socket.send(Message::Text(text.into())).await.unwrap();
}

/// Next server message, failing the test after two seconds
#[allow(dead_code)]
pub async fn next_message(socket: &mut Socket) -> ServerMessage {
    try_next_message(socket, Duration::from_secs(2))
        .await
        .expect("expected a server message")
}

/// Next text frame decoded as a server message, or `None` on timeout or close
#[allow(dead_code)]
pub async fn try_next_message(socket: &mut Socket, wait: Duration) -> Option<ServerMessage> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let frame = tokio::time::timeout_at(deadline, socket.next()).await.ok()??;
        match frame.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

#[allow(dead_code)]
pub fn publish(request_id: &str, event_type: &str) -> ClientMessage {
    ClientMessage::Publish {
        request_id: Some(request_id.to_string()),
        event: NewActivityEvent::new(event_type).with_value(1.0),
    }
}
