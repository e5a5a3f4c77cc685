//! PulseGrid Realtime
//!
//! Authenticated WebSocket access to tenant event streams:
//! - `RealtimeAuthGate`: handshake checks, sessions, abuse detection and per-message authorization
//! - Session caches backed by Redis or process memory
//! - Per-tenant broadcast fan-out and the write-then-notify pipeline
//! - The `/ws` transport

pub mod abuse;
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod gate;
pub mod handshake;
pub mod pipeline;
pub mod rate_limit;
pub mod token;
pub mod ws;

pub use abuse::{AuditStats, Ban};
pub use broadcast::{BroadcastHub, EventPublisher, TenantSubscription};
pub use cache::{MemorySessionCache, RedisSessionCache};
pub use config::AuthGateConfig;
pub use gate::{AuthenticatedConnection, RealtimeAuthGate, SweepTask, spawn_sweep_task};
pub use handshake::Handshake;
pub use pipeline::EventPipeline;
pub use token::{TokenClaims, TokenVerifier};
pub use ws::{ClientMessage, ErrorBody, RealtimeState, ServerMessage, error_response, realtime_router};
