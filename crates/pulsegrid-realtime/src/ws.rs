//! WebSocket transport
//!
//! `/ws` authenticates the upgrade request before accepting it. A refused
//! handshake gets a plain HTTP error body instead of a socket. Each accepted
//! socket runs a writer task fed by an outbound queue and the tenant's
//! broadcast subscription, while the request task reads client messages.

use axum::Router;
use axum::extract::ws::{
    CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code,
};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use pulsegrid_core::events::{ActivityEvent, EventQuery, NewActivityEvent};
use pulsegrid_core::{Error, Permission, TenantId, UserId};
use pulsegrid_observability::{ErrorClass, Metrics, PerformanceMonitor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::gate::{AuthenticatedConnection, RealtimeAuthGate};
use crate::handshake::Handshake;
use crate::pipeline::EventPipeline;

const OUTBOUND_QUEUE_SIZE: usize = 256;
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Messages a client may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Publish {
        #[serde(default)]
        request_id: Option<String>,
        event: NewActivityEvent,
    },
    Query {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        query: EventQuery,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Publish { .. } => "publish",
            ClientMessage::Query { .. } => "query",
            ClientMessage::Ping { .. } => "ping",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientMessage::Publish { request_id, .. }
            | ClientMessage::Query { request_id, .. }
            | ClientMessage::Ping { request_id } => request_id.as_deref(),
        }
    }

    /// Permission the message needs beyond an authenticated session
    pub fn required_permission(&self) -> Option<Permission> {
        match self {
            ClientMessage::Publish { .. } => Some(Permission::WriteEvents),
            ClientMessage::Query { .. } => Some(Permission::ReadEvents),
            ClientMessage::Ping { .. } => None,
        }
    }
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        session_id: String,
        tenant_id: TenantId,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    },
    Event {
        event: ActivityEvent,
    },
    Ack {
        request_id: Option<String>,
        event_id: Uuid,
    },
    Events {
        request_id: Option<String>,
        events: Vec<ActivityEvent>,
    },
    Throttled {
        request_id: Option<String>,
        retry_after_ms: u64,
        reset_at: DateTime<Utc>,
    },
    Error {
        request_id: Option<String>,
        code: String,
        message: String,
    },
    Pong {
        request_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Events { .. } => "events",
            ServerMessage::Throttled { .. } => "throttled",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
        }
    }

    fn from_error(request_id: Option<String>, error: &Error) -> Self {
        ServerMessage::Error {
            request_id,
            code: error.code().to_string(),
            message: client_message(error),
        }
    }
}

/// Error text safe to send to a client
fn client_message(error: &Error) -> String {
    match error {
        Error::AuthRejected(rejection) => rejection.public_message(),
        e if e.client_status() >= 500 => "internal error".to_string(),
        e => e.to_string(),
    }
}

/// JSON body of a refused HTTP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Map an error onto `{code, message}` with its client status
pub fn error_response(error: &Error) -> Response {
    let status =
        StatusCode::from_u16(error.client_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        code: error.code().to_string(),
        message: client_message(error),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug)]
pub(crate) enum Outbound {
    Message(ServerMessage),
    Close(u16, &'static str),
}

/// Whether the reader keeps going after a message
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(u16, &'static str),
}

#[derive(Clone)]
pub struct RealtimeState {
    pub gate: Arc<RealtimeAuthGate>,
    pub pipeline: EventPipeline,
    pub hub: BroadcastHub,
    pub monitor: Option<Arc<PerformanceMonitor>>,
    pub metrics: Option<Arc<Metrics>>,
}

impl RealtimeState {
    pub fn new(gate: Arc<RealtimeAuthGate>, pipeline: EventPipeline, hub: BroadcastHub) -> Self {
        Self {
            gate,
            pipeline,
            hub,
            monitor: None,
            metrics: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub fn realtime_router(state: RealtimeState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<RealtimeState>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    extensions: Extensions,
) -> Response {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let handshake = Handshake::from_request(
        &headers,
        params.get("token").cloned(),
        peer,
        &state.gate.config().trusted_proxies,
    );

    let conn = match state.gate.authenticate(&handshake).await {
        Ok(conn) => conn,
        Err(e) => return error_response(&e),
    };

    let gate = state.gate.clone();
    let session = conn.session.clone();
    ws.on_failed_upgrade(move |e| {
        warn!(session_id = %session.session_id, error = %e, "WebSocket upgrade failed");
        tokio::spawn(async move {
            if let Err(e) = gate.release(&session).await {
                warn!(session_id = %session.session_id, error = %e, "Failed to release session");
            }
        });
    })
    .on_upgrade(move |socket| run_connection(state, socket, conn))
}

async fn run_connection(state: RealtimeState, socket: WebSocket, mut conn: AuthenticatedConnection) {
    let connection_id = conn.session.socket_id.clone();
    let tenant_id = conn.tenant_id();
    let lifetime = state.gate.config().max_connection_lifetime;

    if let Some(monitor) = &state.monitor {
        monitor.register_connection(&connection_id, tenant_id);
    }
    if let Some(metrics) = &state.metrics {
        metrics.connection_opened();
    }

    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE_SIZE);
    let subscription = state.hub.subscribe(tenant_id);
    let mut writer = tokio::spawn(write_loop(
        sink,
        rx,
        subscription,
        state.metrics.clone(),
        connection_id.clone(),
    ));

    let welcome = ServerMessage::Welcome {
        session_id: conn.session_id().to_string(),
        tenant_id,
        user_id: conn.user_id(),
        expires_at: conn.connected_at()
            + chrono::Duration::milliseconds(lifetime.as_millis().min(i64::MAX as u128) as i64),
    };
    let _ = tx.send(Outbound::Message(welcome)).await;

    let deadline = tokio::time::sleep(lifetime);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = &mut deadline => {
                info!(session_id = %conn.session_id(), "Connection lifetime exceeded");
                let _ = tx
                    .send(Outbound::Close(close_code::POLICY, "connection lifetime exceeded"))
                    .await;
                break;
            }
            frame = stream.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(session_id = %conn.session_id(), error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => {
                let text = text.as_str();
                let started = Instant::now();
                let flow = handle_text(&state, &mut conn, &connection_id, text, &tx).await;
                let elapsed = started.elapsed();
                if let Some(monitor) = &state.monitor {
                    monitor.record_message(&connection_id, elapsed, text.len());
                }
                if let Some(metrics) = &state.metrics {
                    metrics.record_inbound("text", text.len(), elapsed.as_secs_f64());
                }
                if let Flow::Close(code, reason) = flow {
                    let _ = tx.send(Outbound::Close(code, reason)).await;
                    break;
                }
            }
            Message::Binary(bytes) => {
                let flow = handle_binary(&state, &mut conn, &tx).await;
                if let Some(metrics) = &state.metrics {
                    metrics.record_inbound("binary", bytes.len(), 0.0);
                }
                if let Flow::Close(code, reason) = flow {
                    let _ = tx.send(Outbound::Close(code, reason)).await;
                    break;
                }
            }
            Message::Close(_) => break,
            // Pings are answered by the protocol layer
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }

    if let Err(e) = state.gate.disconnect(&conn).await {
        warn!(session_id = %conn.session_id(), error = %e, "Failed to release session");
    }
    if let Some(monitor) = &state.monitor {
        monitor.unregister_connection(&connection_id);
    }
    if let Some(metrics) = &state.metrics {
        metrics.connection_closed();
    }
    info!(
        session_id = %conn.session_id(),
        events_published = conn.events_published(),
        "Connection closed"
    );
}

async fn write_loop(
    mut sink: futures::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut subscription: crate::broadcast::TenantSubscription,
    metrics: Option<Arc<Metrics>>,
    connection_id: String,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            queued = rx.recv() => match queued {
                Some(outbound) => outbound,
                None => break,
            },
            event = subscription.recv() => match event {
                Ok(event) => Outbound::Message(ServerMessage::Event {
                    event: event.as_ref().clone(),
                }),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(connection_id = %connection_id, skipped, "Subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        match outbound {
            Outbound::Message(message) => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Failed to encode message");
                        continue;
                    }
                };
                if let Some(metrics) = &metrics {
                    metrics.record_outbound(message.kind(), text.len());
                }
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Outbound::Close(code, reason) => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Utf8Bytes::from_static(reason),
                    })))
                    .await;
                break;
            }
        }
    }
}

fn error_class(error: &Error) -> ErrorClass {
    if error.is_retryable() {
        ErrorClass::Connection
    } else {
        ErrorClass::Data
    }
}

/// Reply to a frame the gate refused before it was handled
async fn refuse_frame(error: Error, tx: &mpsc::Sender<Outbound>) -> Flow {
    let (message, flow) = match error {
        Error::RateLimitExceeded {
            retry_after_ms,
            reset_at,
        } => (
            ServerMessage::Throttled {
                request_id: None,
                retry_after_ms,
                reset_at,
            },
            Flow::Continue,
        ),
        e @ Error::AuthRejected(_) => (
            ServerMessage::from_error(None, &e),
            Flow::Close(close_code::POLICY, "session expired"),
        ),
        e => (ServerMessage::from_error(None, &e), Flow::Continue),
    };
    let _ = tx.send(Outbound::Message(message)).await;
    flow
}

pub(crate) async fn handle_binary(
    state: &RealtimeState,
    conn: &mut AuthenticatedConnection,
    tx: &mpsc::Sender<Outbound>,
) -> Flow {
    if let Err(e) = state.gate.authorize_request(conn, None).await {
        return refuse_frame(e, tx).await;
    }
    let _ = tx
        .send(Outbound::Message(ServerMessage::Error {
            request_id: None,
            code: "BAD_REQUEST".to_string(),
            message: "binary frames are not supported".to_string(),
        }))
        .await;
    Flow::Continue
}

pub(crate) async fn handle_text(
    state: &RealtimeState,
    conn: &mut AuthenticatedConnection,
    connection_id: &str,
    text: &str,
    tx: &mpsc::Sender<Outbound>,
) -> Flow {
    let reply = |message: ServerMessage| async move {
        let _ = tx.send(Outbound::Message(message)).await;
    };

    // Charged before parsing so malformed frames count against the window
    if let Err(e) = state.gate.authorize_request(conn, None).await {
        return refuse_frame(e, tx).await;
    }

    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            if let Some(monitor) = &state.monitor {
                monitor.record_error(connection_id, ErrorClass::Data);
            }
            reply(ServerMessage::Error {
                request_id: None,
                code: "BAD_REQUEST".to_string(),
                message: format!("malformed message: {}", e),
            })
            .await;
            return Flow::Continue;
        }
    };

    if let Some(permission) = message.required_permission()
        && let Err(e) = state.gate.require_permission(conn, permission)
    {
        let request_id = message.request_id().map(str::to_string);
        reply(ServerMessage::from_error(request_id, &e)).await;
        return Flow::Continue;
    }

    match message {
        ClientMessage::Publish {
            request_id,
            mut event,
        } => {
            // Events are always attributed to the authenticated user
            event.user_id = Some(conn.user_id());
            match state.pipeline.submit(&conn.handle(), event).await {
                Ok(stored) => {
                    reply(ServerMessage::Ack {
                        request_id,
                        event_id: stored.id,
                    })
                    .await;
                    let published = conn.record_event_published();
                    if published >= state.gate.config().max_events_per_session {
                        info!(session_id = %conn.session_id(), published, "Event limit reached");
                        return Flow::Close(close_code::POLICY, "event limit reached");
                    }
                }
                Err(e) => {
                    if let Some(monitor) = &state.monitor {
                        monitor.record_error(connection_id, error_class(&e));
                    }
                    warn!(session_id = %conn.session_id(), error = %e, "Publish failed");
                    reply(ServerMessage::from_error(request_id, &e)).await;
                }
            }
        }
        ClientMessage::Query { request_id, query } => {
            match state.pipeline.query(&conn.read_handle(), &query).await {
                Ok(events) => reply(ServerMessage::Events { request_id, events }).await,
                Err(e) => {
                    if let Some(monitor) = &state.monitor {
                        monitor.record_error(connection_id, error_class(&e));
                    }
                    reply(ServerMessage::from_error(request_id, &e)).await;
                }
            }
        }
        ClientMessage::Ping { request_id } => reply(ServerMessage::Pong { request_id }).await,
    }
    Flow::Continue
}
