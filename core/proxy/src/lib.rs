//! Harbor proxy
//!
//! Local HTTP front for an origin server. Every request goes through the
//! cache strategy router; mutations that cannot reach the origin are queued
//! for replay and acknowledged with `202 Accepted`. Clients can follow cache
//! version activations as server-sent events.

pub mod handlers;
pub mod server;

pub use handlers::{HealthResponse, ProxyState, VERSION_EVENT};
pub use server::{app, ProxyServer, EVENTS_PATH, HEALTH_PATH, QUEUE_PATH};
