//! Cache backend trait definition.

use async_trait::async_trait;

use harbor_common::{HttpResponse, RequestKey, Result};

/// Storage for named cache namespaces.
///
/// Namespaces are plain strings at this level: the backend may hold
/// namespaces written by other versions or other tools, and the lifecycle
/// layer decides which of them it owns. Reads and writes are atomic per key.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// List every namespace currently present.
    async fn namespaces(&self) -> Result<Vec<String>>;

    /// Create a namespace if it does not exist.
    async fn open(&self, namespace: &str) -> Result<()>;

    /// Look up a cached response.
    ///
    /// A miss, including a lookup in a namespace that does not exist, is
    /// `Ok(None)`.
    async fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<HttpResponse>>;

    /// Store a response, replacing any previous entry for the key.
    ///
    /// # Postconditions
    /// - The namespace exists
    async fn put(&self, namespace: &str, key: &RequestKey, response: &HttpResponse) -> Result<()>;

    /// Delete a namespace with all its entries.
    ///
    /// Returns whether the namespace existed.
    async fn delete_namespace(&self, namespace: &str) -> Result<bool>;

    /// Version recorded by the most recent activation, if any.
    ///
    /// Shared by every handle on the same storage, so a context can notice
    /// that another one activated a newer version.
    async fn active_version(&self) -> Result<Option<String>>;

    /// Record `version` as the active one.
    async fn set_active_version(&self, version: &str) -> Result<()>;
}
