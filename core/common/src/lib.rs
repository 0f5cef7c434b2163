//! Common utilities and types shared across Harbor modules.
//!
//! This module provides the foundational request/response model, the
//! versioned namespace identifiers, the SQLite connection handle and the
//! configuration layer used by the cache, sync and proxy crates.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

pub use config::{HarborConfig, ProbeConfig, RetrySettings, RouteRules};
pub use db::LazyConnection;
pub use error::{Error, Result};
pub use types::{Bucket, CacheVersion, HttpRequest, HttpResponse, NamespaceId, RequestKey};
