//! PulseGrid Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout PulseGrid:
//! - Tenant, user, session and activity-event data model
//! - The explicit `TenantHandle` every storage call takes
//! - Storage and session-cache trait abstractions
//! - Core error types

pub mod auth;
pub mod cache;
pub mod error;
pub mod events;
pub mod store;
pub mod tenant;
pub mod user;

pub use error::{Error, Result};
pub use tenant::{AccessLevel, TenantHandle, TenantId};
pub use user::{Permission, Role, User, UserId};
