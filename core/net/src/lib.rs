//! Network primitive for Harbor.
//!
//! Everything that talks to the upstream origin goes through the [`Fetcher`]
//! trait, so the strategy router, the cache installer and the sync processor
//! can run against a real HTTP client or a scripted in-memory double.

pub mod fetcher;
pub mod http_client;
pub mod memory;

pub use fetcher::Fetcher;
pub use http_client::HttpFetcher;
pub use memory::MemoryFetcher;
