//! Harbor response cache.
//!
//! This crate provides:
//! - A backend abstraction for versioned cache namespaces, with in-memory
//!   and SQLite implementations
//! - The cache lifecycle (install, activate, supersede) tied to deployment
//!   versions
//! - A version-activation broadcast for connected clients
//! - The per-request strategy router (cache-first, network-first,
//!   network-only)

pub mod backend;
pub mod memory;
pub mod publisher;
pub mod router;
pub mod sqlite;
pub mod store;

pub use backend::CacheBackend;
pub use memory::MemoryBackend;
pub use publisher::{BroadcastPublisher, VersionEvent, VersionPublisher};
pub use router::{CacheStrategyRouter, Strategy};
pub use sqlite::SqliteBackend;
pub use store::{ActivationReport, CacheStore, InstallReport, LifecycleState};
