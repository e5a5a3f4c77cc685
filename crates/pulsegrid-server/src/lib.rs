//! PulseGrid server
//!
//! Wires the PostgreSQL store, the realtime gate and the performance monitor
//! into one axum application. The binary in `main.rs` adds the CLI and the
//! database maintenance commands.

pub mod admin;
pub mod app;
pub mod config;

pub use app::{AppState, ServiceReadiness, Storage, build_router};
pub use config::{ConfigError, ServerConfig};
