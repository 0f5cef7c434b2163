//! Versioned cache namespaces and their lifecycle.
//!
//! A [`CacheStore`] owns one static and one API namespace for a single
//! deployment version. It moves through
//! `Uninitialized -> Installing -> Active -> Superseded`:
//!
//! - `install()` pre-populates the static namespace from the asset manifest
//! - `activate()` purges every namespace left behind by other versions and
//!   tells connected clients that a new version is live
//! - `supersede()` retires the instance once a newer version has activated;
//!   a superseded store no longer reads or writes the cache
//!
//! Activations made by other contexts sharing the backend are noticed either
//! through the publisher ([`CacheStore::follow`]) or by polling the version
//! the backend records ([`CacheStore::watch_activations`]).

use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;

use harbor_common::{
    Bucket, CacheVersion, Error, HttpRequest, HttpResponse, NamespaceId, RequestKey, Result,
};
use harbor_net::Fetcher;

use crate::backend::CacheBackend;
use crate::publisher::{VersionEvent, VersionPublisher};

/// Lifecycle state of a cache version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Nothing has happened yet.
    Uninitialized,
    /// Installed or installing; older versions may still own the cache.
    Installing,
    /// Serving; stale namespaces have been purged.
    Active,
    /// A newer version took over.
    Superseded,
}

/// Outcome of `install()`.
#[derive(Debug, Clone)]
pub struct InstallReport {
    /// Namespace that was populated.
    pub namespace: NamespaceId,
    /// Manifest assets stored.
    pub cached: usize,
    /// Manifest assets that could not be fetched.
    pub failed: Vec<Url>,
}

/// Outcome of `activate()`.
#[derive(Debug, Clone)]
pub struct ActivationReport {
    /// Version now active.
    pub version: CacheVersion,
    /// Namespaces deleted because they belonged to other versions.
    pub purged: Vec<String>,
    /// Clients notified of the activation.
    pub notified: usize,
}

/// Cache lifecycle manager for one deployment version.
pub struct CacheStore {
    version: CacheVersion,
    backend: Arc<dyn CacheBackend>,
    fetcher: Arc<dyn Fetcher>,
    publisher: Arc<dyn VersionPublisher>,
    manifest: Vec<Url>,
    state: RwLock<LifecycleState>,
    /// Serializes install/activate transitions.
    transition: Mutex<()>,
}

impl CacheStore {
    /// Create a store for `version`.
    pub fn new(
        version: CacheVersion,
        backend: Arc<dyn CacheBackend>,
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn VersionPublisher>,
    ) -> Self {
        Self {
            version,
            backend,
            fetcher,
            publisher,
            manifest: Vec::new(),
            state: RwLock::new(LifecycleState::Uninitialized),
            transition: Mutex::new(()),
        }
    }

    /// Set the critical assets pre-cached at install.
    pub fn with_manifest(mut self, manifest: Vec<Url>) -> Self {
        self.manifest = manifest;
        self
    }

    /// Version this store serves.
    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Namespace for a bucket at this version.
    pub fn namespace(&self, bucket: Bucket) -> NamespaceId {
        NamespaceId::new(bucket, self.version.clone())
    }

    /// Open the static namespace and pre-populate it with the manifest.
    ///
    /// A manifest asset that cannot be fetched is logged and skipped; the
    /// namespace may end up partially populated.
    ///
    /// # Errors
    /// - The static namespace cannot be created
    pub async fn install(&self) -> Result<InstallReport> {
        let _guard = self.transition.lock().await;
        self.set_state(LifecycleState::Installing);

        let namespace = self.namespace(Bucket::Static);
        info!("Installing cache version {} into {}", self.version, namespace);
        let name = namespace.to_string();
        self.backend.open(&name).await?;

        let name = name.as_str();
        let fetches = self.manifest.iter().map(|url| async move {
            let request = HttpRequest::get(url.clone());
            let outcome = match self.fetcher.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    self.backend.put(name, &request.key(), &response).await
                }
                Ok(response) => Err(Error::Http {
                    status: response.status.as_u16(),
                    url: url.to_string(),
                }),
                Err(e) => Err(e),
            };
            (url, outcome)
        });

        let mut cached = 0;
        let mut failed = Vec::new();
        for (url, outcome) in join_all(fetches).await {
            match outcome {
                Ok(()) => cached += 1,
                Err(e) => {
                    warn!("Failed to pre-cache {}: {}", url, e);
                    failed.push(url.clone());
                }
            }
        }

        info!(
            "Install of version {} cached {} of {} manifest assets",
            self.version,
            cached,
            self.manifest.len()
        );

        Ok(InstallReport {
            namespace,
            cached,
            failed,
        })
    }

    /// Make this version the only one in the cache.
    ///
    /// Deletes every `<bucket>-v<version>` namespace whose version differs
    /// from this store's, while concurrently broadcasting the activation to
    /// connected clients. Namespaces outside that naming scheme are left
    /// alone.
    ///
    /// # Errors
    /// - Namespaces cannot be listed
    /// - A stale namespace could not be deleted (the store stays inactive)
    /// - The active version cannot be recorded
    pub async fn activate(&self, previous: Option<CacheVersion>) -> Result<ActivationReport> {
        let _guard = self.transition.lock().await;
        info!(
            "Activating cache version {} (previous: {})",
            self.version,
            previous.as_ref().map_or("none", CacheVersion::as_str)
        );

        let stale: Vec<String> = self
            .backend
            .namespaces()
            .await?
            .into_iter()
            .filter(|name| {
                NamespaceId::parse(name).is_some_and(|ns| ns.version != self.version)
            })
            .collect();

        let purge = async {
            let mut purged = Vec::new();
            let mut failures = 0;
            for name in &stale {
                match self.backend.delete_namespace(name).await {
                    Ok(_) => {
                        debug!("Purged stale namespace {}", name);
                        purged.push(name.clone());
                    }
                    Err(e) => {
                        error!("Failed to purge namespace {}: {}", name, e);
                        failures += 1;
                    }
                }
            }
            (purged, failures)
        };

        let event = VersionEvent::new(self.version.clone(), previous);
        let notify = async {
            match self.publisher.publish(event).await {
                Ok(count) => count,
                Err(e) => {
                    warn!("Failed to notify clients of version {}: {}", self.version, e);
                    0
                }
            }
        };

        let ((purged, failures), notified) = tokio::join!(purge, notify);

        if failures > 0 {
            return Err(Error::Storage(format!(
                "{} stale namespace(s) could not be purged",
                failures
            )));
        }

        self.backend.set_active_version(self.version.as_str()).await?;
        self.set_state(LifecycleState::Active);
        info!(
            "Cache version {} active: purged {} namespace(s), notified {} client(s)",
            self.version,
            purged.len(),
            notified
        );

        Ok(ActivationReport {
            version: self.version.clone(),
            purged,
            notified,
        })
    }

    /// Retire this version after a newer one activated.
    ///
    /// Returns whether this call retired it.
    pub fn supersede(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == LifecycleState::Superseded {
            return false;
        }
        *state = LifecycleState::Superseded;
        info!("Cache version {} superseded", self.version);
        true
    }

    /// Retire this version if the backend records a different active one.
    ///
    /// Only an active store is checked. When another context took over, the
    /// activation is re-announced to this context's subscribers. Returns
    /// whether the store is superseded.
    pub async fn check_activation(&self) -> bool {
        match self.state() {
            LifecycleState::Superseded => return true,
            LifecycleState::Active => {}
            _ => return false,
        }

        let recorded = match self.backend.active_version().await {
            Ok(Some(recorded)) if recorded != self.version.as_str() => recorded,
            Ok(_) => return false,
            Err(e) => {
                warn!("Failed to read active cache version: {}", e);
                return false;
            }
        };

        if !self.supersede() {
            return true;
        }
        match CacheVersion::new(recorded) {
            Ok(newer) => {
                let event = VersionEvent::new(newer, Some(self.version.clone()));
                if let Err(e) = self.publisher.publish(event).await {
                    warn!("Failed to notify clients of version change: {}", e);
                }
            }
            Err(e) => warn!("Backend records an invalid active version: {}", e),
        }
        true
    }

    /// Retire this version when `events` announces a different one.
    ///
    /// Returns once superseded or when the channel closes.
    pub async fn follow(&self, mut events: broadcast::Receiver<VersionEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if event.version != self.version && self.state() == LifecycleState::Active {
                        self.supersede();
                        return;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!("Missed {} version events, checking backend", missed);
                    if self.check_activation().await {
                        return;
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    /// Poll the backend for activations made by other contexts.
    ///
    /// The task ends once this store is superseded.
    pub fn watch_activations(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if store.check_activation().await {
                    break;
                }
            }
            debug!("Stopped watching activations for version {}", store.version);
        })
    }

    /// Look up a response in this version's namespace for `bucket`.
    ///
    /// Storage failures are logged and reported as a miss. A superseded
    /// store always misses.
    pub async fn lookup(&self, bucket: Bucket, key: &RequestKey) -> Option<HttpResponse> {
        if self.state() == LifecycleState::Superseded {
            debug!("Version {} superseded, not reading {}", self.version, key);
            return None;
        }
        let namespace = self.namespace(bucket).to_string();
        match self.backend.get(&namespace, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Cache lookup for {} in {} failed: {}", key, namespace, e);
                None
            }
        }
    }

    /// Store a response in this version's namespace for `bucket`.
    ///
    /// Storage failures are logged; returns whether the entry was written.
    /// A superseded store writes nothing, so its namespaces stay purged.
    pub async fn store(&self, bucket: Bucket, key: &RequestKey, response: &HttpResponse) -> bool {
        if self.check_activation().await {
            debug!("Version {} superseded, not caching {}", self.version, key);
            return false;
        }
        let namespace = self.namespace(bucket).to_string();
        match self.backend.put(&namespace, key, response).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Cache write for {} in {} failed: {}", key, namespace, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::publisher::BroadcastPublisher;
    use async_trait::async_trait;
    use harbor_net::MemoryFetcher;
    use http::{Method, StatusCode};

    const ROOT: &str = "https://app.example/";
    const LOGO: &str = "https://app.example/assets/logo.png";

    fn version(v: &str) -> CacheVersion {
        CacheVersion::new(v).unwrap()
    }

    fn store_with(
        v: &str,
        backend: &MemoryBackend,
        fetcher: &MemoryFetcher,
        publisher: &BroadcastPublisher,
    ) -> CacheStore {
        CacheStore::new(
            version(v),
            Arc::new(backend.clone()),
            Arc::new(fetcher.clone()),
            Arc::new(publisher.clone()),
        )
        .with_manifest(vec![Url::parse(ROOT).unwrap(), Url::parse(LOGO).unwrap()])
    }

    #[tokio::test]
    async fn test_install_populates_manifest() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        fetcher.respond(Method::GET, ROOT, HttpResponse::new(StatusCode::OK, "<html>"));
        fetcher.respond(Method::GET, LOGO, HttpResponse::new(StatusCode::OK, "png"));
        let store = store_with("1", &backend, &fetcher, &BroadcastPublisher::new());

        let report = store.install().await.unwrap();

        assert_eq!(report.cached, 2);
        assert!(report.failed.is_empty());
        assert_eq!(store.state(), LifecycleState::Installing);
        assert_eq!(backend.entry_count("static-v1"), 2);
    }

    #[tokio::test]
    async fn test_install_tolerates_partial_failure() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        fetcher.respond(Method::GET, ROOT, HttpResponse::new(StatusCode::OK, "<html>"));
        fetcher.fail(Method::GET, LOGO);
        let store = store_with("1", &backend, &fetcher, &BroadcastPublisher::new());

        let report = store.install().await.unwrap();

        assert_eq!(report.cached, 1);
        assert_eq!(report.failed, vec![Url::parse(LOGO).unwrap()]);
        let root = RequestKey::get(&Url::parse(ROOT).unwrap());
        assert!(store.lookup(Bucket::Static, &root).await.is_some());
    }

    #[tokio::test]
    async fn test_install_skips_error_status() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        fetcher.respond(Method::GET, ROOT, HttpResponse::new(StatusCode::OK, "<html>"));
        // LOGO is unrouted and answers 404.
        let store = store_with("1", &backend, &fetcher, &BroadcastPublisher::new());

        let report = store.install().await.unwrap();
        assert_eq!(report.cached, 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_activation_purges_other_versions() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        let publisher = BroadcastPublisher::new();
        let key = RequestKey::get(&Url::parse(LOGO).unwrap());
        let response = HttpResponse::new(StatusCode::OK, "png");

        let v1 = store_with("1", &backend, &fetcher, &publisher);
        v1.store(Bucket::Static, &key, &response).await;
        v1.store(Bucket::Api, &key, &response).await;
        v1.activate(None).await.unwrap();
        backend.open("user-downloads").await.unwrap();

        let v2 = store_with("2", &backend, &fetcher, &publisher);
        v2.install().await.unwrap();
        let report = v2.activate(Some(version("1"))).await.unwrap();
        v1.supersede();

        let mut purged = report.purged.clone();
        purged.sort();
        assert_eq!(purged, vec!["api-v1", "static-v1"]);
        assert_eq!(v2.state(), LifecycleState::Active);
        assert_eq!(v1.state(), LifecycleState::Superseded);

        let mut remaining = backend.namespaces().await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["static-v2", "user-downloads"]);
        assert!(v1.lookup(Bucket::Static, &key).await.is_none());
        assert!(v1.lookup(Bucket::Api, &key).await.is_none());
    }

    #[tokio::test]
    async fn test_activation_notifies_clients() {
        let backend = MemoryBackend::new();
        let publisher = BroadcastPublisher::new();
        let mut client = publisher.subscribe();
        let store = store_with("5", &backend, &MemoryFetcher::new(), &publisher);

        let report = store.activate(Some(version("4"))).await.unwrap();

        assert_eq!(report.notified, 1);
        let event = client.recv().await.unwrap();
        assert_eq!(event.version, version("5"));
        assert_eq!(event.previous, Some(version("4")));
    }

    #[tokio::test]
    async fn test_superseded_store_does_not_resurrect_namespace() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        let key = RequestKey::get(&Url::parse(LOGO).unwrap());
        let response = HttpResponse::new(StatusCode::OK, "png");

        let v1 = store_with("1", &backend, &fetcher, &BroadcastPublisher::new());
        v1.activate(None).await.unwrap();
        let v2 = store_with("2", &backend, &fetcher, &BroadcastPublisher::new());
        v2.activate(Some(version("1"))).await.unwrap();

        // v1 never heard about v2, but the backend records the takeover.
        assert!(!v1.store(Bucket::Static, &key, &response).await);
        assert_eq!(v1.state(), LifecycleState::Superseded);
        assert!(backend.namespaces().await.unwrap().is_empty());
        assert!(v1.lookup(Bucket::Static, &key).await.is_none());

        assert!(v2.store(Bucket::Static, &key, &response).await);
        assert_eq!(backend.namespaces().await.unwrap(), vec!["static-v2"]);
    }

    #[tokio::test]
    async fn test_activation_records_version() {
        let backend = MemoryBackend::new();
        let store = store_with("4", &backend, &MemoryFetcher::new(), &BroadcastPublisher::new());

        assert!(!store.check_activation().await);
        store.activate(None).await.unwrap();
        assert_eq!(backend.active_version().await.unwrap().as_deref(), Some("4"));
        assert!(!store.check_activation().await);
    }

    #[tokio::test]
    async fn test_follow_supersedes_on_other_version() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        let publisher = BroadcastPublisher::new();

        let v1 = store_with("1", &backend, &fetcher, &publisher);
        v1.activate(None).await.unwrap();
        let events = publisher.subscribe();
        let v2 = store_with("2", &backend, &fetcher, &publisher);

        tokio::join!(v1.follow(events), async {
            v2.activate(Some(version("1"))).await.unwrap();
        });

        assert_eq!(v1.state(), LifecycleState::Superseded);
        assert_eq!(v2.state(), LifecycleState::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_announces_foreign_activation() {
        let backend = MemoryBackend::new();
        let fetcher = MemoryFetcher::new();
        let local = BroadcastPublisher::new();
        let mut client = local.subscribe();

        let v1 = Arc::new(store_with("1", &backend, &fetcher, &local));
        v1.activate(None).await.unwrap();
        assert_eq!(client.recv().await.unwrap().version, version("1"));
        let watcher = v1.watch_activations(Duration::from_secs(1));

        // Activated by another process sharing the storage.
        let v2 = store_with("2", &backend, &fetcher, &BroadcastPublisher::new());
        v2.activate(Some(version("1"))).await.unwrap();

        watcher.await.unwrap();
        assert_eq!(v1.state(), LifecycleState::Superseded);
        let event = client.recv().await.unwrap();
        assert_eq!(event.version, version("2"));
        assert_eq!(event.previous, Some(version("1")));
    }

    struct BrokenBackend;

    #[async_trait]
    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }
        async fn namespaces(&self) -> Result<Vec<String>> {
            Ok(vec!["static-v0".to_string()])
        }
        async fn open(&self, _namespace: &str) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn get(&self, _namespace: &str, _key: &RequestKey) -> Result<Option<HttpResponse>> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn put(&self, _ns: &str, _key: &RequestKey, _r: &HttpResponse) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn delete_namespace(&self, _namespace: &str) -> Result<bool> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn active_version(&self) -> Result<Option<String>> {
            Err(Error::Storage("disk full".to_string()))
        }
        async fn set_active_version(&self, _version: &str) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_storage_failures_degrade() {
        let store = CacheStore::new(
            version("1"),
            Arc::new(BrokenBackend),
            Arc::new(MemoryFetcher::new()),
            Arc::new(BroadcastPublisher::new()),
        );
        let key = RequestKey::get(&Url::parse(ROOT).unwrap());

        assert!(store.lookup(Bucket::Static, &key).await.is_none());
        assert!(!store.store(Bucket::Static, &key, &HttpResponse::new(StatusCode::OK, "")).await);
        assert!(store.install().await.is_err());
        assert!(store.activate(None).await.is_err());
        assert_ne!(store.state(), LifecycleState::Active);
    }
}
