//! Per-request cache strategy selection.
//!
//! Every intercepted request is classified and served by one strategy:
//!
//! | Request                          | Strategy                          |
//! |----------------------------------|-----------------------------------|
//! | any non-GET                      | network, cache bypassed           |
//! | GET under the assets prefix/image| cache-first (static namespace)    |
//! | GET under the API prefix         | network-first, cached fallback    |
//! | GET accepting `text/html`        | network-first, cached root page   |
//! | anything else                    | network-only                      |
//!
//! `handle` never fails: a network error is always resolved into a cached
//! fallback or a synthesized 503.

use http::Method;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use url::Url;

use harbor_common::{Bucket, Error, HttpRequest, HttpResponse, RequestKey, Result, RouteRules};
use harbor_net::Fetcher;

use crate::store::CacheStore;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Mutating request: straight to the network, never cached.
    Bypass,
    /// Static asset: serve from cache, fetch and cache on miss.
    CacheFirst,
    /// API read: fetch and cache, fall back to cache when offline.
    NetworkFirst,
    /// HTML navigation: fetch and cache, fall back to the cached root page.
    Navigation,
    /// Anything else: network only.
    NetworkOnly,
}

/// Request interceptor applying the cache strategies.
pub struct CacheStrategyRouter {
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    rules: RouteRules,
    root: Url,
    /// Background cache writes that must not delay responses.
    writes: TaskTracker,
}

impl CacheStrategyRouter {
    /// Create a router.
    ///
    /// `origin` is used to locate the root document served as the offline
    /// fallback for navigations.
    pub fn new(
        store: Arc<CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        rules: RouteRules,
        origin: &Url,
    ) -> Result<Self> {
        let root = origin
            .join("/")
            .map_err(|e| Error::Config(format!("Invalid origin {}: {}", origin, e)))?;

        Ok(Self {
            store,
            fetcher,
            rules,
            root,
            writes: TaskTracker::new(),
        })
    }

    /// The cache store this router reads and writes.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    /// Pick the strategy for a request.
    pub fn classify(&self, request: &HttpRequest) -> Strategy {
        if request.method != Method::GET {
            return Strategy::Bypass;
        }

        let path = request.url.path();
        if self.is_static_asset(path) {
            Strategy::CacheFirst
        } else if path.starts_with(&self.rules.api_prefix) {
            Strategy::NetworkFirst
        } else if request.accepts_html() {
            Strategy::Navigation
        } else {
            Strategy::NetworkOnly
        }
    }

    fn is_static_asset(&self, path: &str) -> bool {
        if path.starts_with(&self.rules.assets_prefix) {
            return true;
        }

        let file = path.rsplit('/').next().unwrap_or_default();
        match file.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.rules.image_extensions.iter().any(|known| *known == ext)
            }
            _ => false,
        }
    }

    /// Serve a request. Never fails.
    pub async fn handle(&self, request: HttpRequest) -> HttpResponse {
        let strategy = self.classify(&request);
        debug!("{} {} -> {:?}", request.method, request.url, strategy);

        match strategy {
            Strategy::Bypass | Strategy::NetworkOnly => match self.forward(&request).await {
                Ok(response) => response,
                Err(e) => {
                    debug!("Network-only request {} failed: {}", request.url, e);
                    self.offline_response(&request)
                }
            },
            Strategy::CacheFirst => self.cache_first(&request).await,
            Strategy::NetworkFirst => self.network_first(&request).await,
            Strategy::Navigation => self.navigation(&request).await,
        }
    }

    /// Send a request to the network without touching the cache.
    ///
    /// Unlike [`handle`](Self::handle) this reports transport failures, so
    /// callers can decide to queue a mutation for later replay.
    pub async fn forward(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.fetcher.fetch(request).await
    }

    /// Wait until background cache writes have landed.
    pub async fn settle(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    async fn cache_first(&self, request: &HttpRequest) -> HttpResponse {
        let key = request.key();
        if let Some(hit) = self.store.lookup(Bucket::Static, &key).await {
            debug!("Static cache hit for {}", key);
            return hit;
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    let store = self.store.clone();
                    let copy = response.clone();
                    self.writes.spawn(async move {
                        store.store(Bucket::Static, &key, &copy).await;
                    });
                }
                response
            }
            Err(e) => {
                warn!("Static asset {} unavailable: {}", request.url, e);
                self.offline_response(request)
            }
        }
    }

    async fn network_first(&self, request: &HttpRequest) -> HttpResponse {
        let key = request.key();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store.store(Bucket::Api, &key, &response).await;
                }
                response
            }
            Err(e) => {
                debug!("API fetch for {} failed, trying cache: {}", key, e);
                match self.store.lookup(Bucket::Api, &key).await {
                    Some(cached) => cached,
                    None => HttpResponse::offline_api(&request.url),
                }
            }
        }
    }

    async fn navigation(&self, request: &HttpRequest) -> HttpResponse {
        let key = request.key();
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.store.store(Bucket::Static, &key, &response).await;
                }
                response
            }
            Err(e) => {
                debug!("Navigation to {} failed, serving root: {}", request.url, e);
                let root = RequestKey::get(&self.root);
                match self.store.lookup(Bucket::Static, &root).await {
                    Some(cached) => cached,
                    None => HttpResponse::offline_page(),
                }
            }
        }
    }

    fn offline_response(&self, request: &HttpRequest) -> HttpResponse {
        if request.accepts_html() {
            HttpResponse::offline_page()
        } else {
            HttpResponse::offline_api(&request.url)
        }
    }
}
