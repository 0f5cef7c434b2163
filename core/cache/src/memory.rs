//! In-memory cache backend for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use harbor_common::{HttpResponse, RequestKey, Result};

use crate::backend::CacheBackend;

type Namespaces = BTreeMap<String, HashMap<RequestKey, HttpResponse>>;

/// In-memory cache backend.
///
/// Useful for testing and development. All entries are lost on drop;
/// clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    namespaces: Arc<RwLock<Namespaces>>,
    active: Arc<RwLock<Option<String>>>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a namespace.
    pub fn entry_count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    async fn open(&self, namespace: &str) -> Result<()> {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<HttpResponse>> {
        Ok(self
            .namespaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn put(&self, namespace: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
        self.namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(namespace.to_string())
            .or_default()
            .insert(key.clone(), response.clone());
        Ok(())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        Ok(self
            .namespaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace)
            .is_some())
    }

    async fn active_version(&self) -> Result<Option<String>> {
        Ok(self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn set_active_version(&self, version: &str) -> Result<()> {
        *self.active.write().unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn key(url: &str) -> RequestKey {
        RequestKey {
            method: "GET".to_string(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let backend = MemoryBackend::new();
        let k = key("https://app.example/api/me");

        backend
            .put("api-v1", &k, &HttpResponse::new(StatusCode::OK, "old"))
            .await
            .unwrap();
        backend
            .put("api-v1", &k, &HttpResponse::new(StatusCode::OK, "new"))
            .await
            .unwrap();

        let hit = backend.get("api-v1", &k).await.unwrap().unwrap();
        assert_eq!(&hit.body[..], b"new");
        assert_eq!(backend.entry_count("api-v1"), 1);
    }

    #[tokio::test]
    async fn test_delete_namespace() {
        let backend = MemoryBackend::new();
        backend.open("static-v1").await.unwrap();

        assert!(backend.delete_namespace("static-v1").await.unwrap());
        assert!(!backend.delete_namespace("static-v1").await.unwrap());
        assert!(backend.namespaces().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_active_version() {
        let backend = MemoryBackend::new();
        let other = backend.clone();
        assert!(other.active_version().await.unwrap().is_none());

        backend.set_active_version("3").await.unwrap();
        assert_eq!(other.active_version().await.unwrap().as_deref(), Some("3"));
    }
}
