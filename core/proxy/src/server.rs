//! Proxy server.

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use harbor_common::Result;

use crate::handlers::{events, health, proxy, queue, ProxyState};

/// Health endpoint, served by the proxy itself.
pub const HEALTH_PATH: &str = "/__harbor/health";
/// Pending-mutation listing, served by the proxy itself.
pub const QUEUE_PATH: &str = "/__harbor/queue";
/// Version activation stream, served by the proxy itself.
pub const EVENTS_PATH: &str = "/__harbor/events";

/// Build the proxy router.
pub fn app(state: ProxyState) -> Router {
    routes(Arc::new(state))
}

fn routes(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(QUEUE_PATH, get(queue))
        .route(EVENTS_PATH, get(events))
        .fallback(proxy)
        .with_state(state)
}

/// Proxy server
pub struct ProxyServer {
    listen: SocketAddr,
    state: ProxyState,
}

impl ProxyServer {
    /// Create a server listening on `listen`.
    pub fn new(listen: SocketAddr, state: ProxyState) -> Self {
        Self { listen, state }
    }

    /// Serve until `shutdown` resolves.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.listen).await?;
        info!("Harbor proxy listening on {}", listener.local_addr()?);

        let state = Arc::new(self.state);
        let closing = state.clone();
        axum::serve(listener, routes(state))
            .with_graceful_shutdown(async move {
                shutdown.await;
                closing.close_streams();
            })
            .await?;

        info!("Harbor proxy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request, StatusCode};
    use futures::StreamExt;
    use harbor_cache::{
        BroadcastPublisher, CacheStore, CacheStrategyRouter, MemoryBackend, VersionEvent,
    };
    use harbor_common::{CacheVersion, HttpResponse, RouteRules};
    use harbor_net::MemoryFetcher;
    use harbor_sync::{ConnectivityState, SqliteQueue, SyncQueue};
    use serde_json::{json, Value};
    use tokio::sync::watch;
    use tower::ServiceExt;
    use url::Url;

    const ORIGIN: &str = "https://app.example/";

    struct Fixture {
        network: MemoryFetcher,
        queue: SyncQueue,
        store: Arc<CacheStore>,
        publisher: BroadcastPublisher,
        state: Option<ProxyState>,
    }

    fn fixture() -> Fixture {
        let network = MemoryFetcher::new();
        let origin = Url::parse(ORIGIN).unwrap();
        let publisher = BroadcastPublisher::new();
        let store = Arc::new(CacheStore::new(
            CacheVersion::new("1").unwrap(),
            Arc::new(MemoryBackend::new()),
            Arc::new(network.clone()),
            Arc::new(publisher.clone()),
        ));
        let router = CacheStrategyRouter::new(
            store.clone(),
            Arc::new(network.clone()),
            RouteRules::default(),
            &origin,
        )
        .unwrap();
        let queue = SyncQueue::new(Arc::new(SqliteQueue::in_memory()));

        Fixture {
            state: Some(ProxyState::new(Arc::new(router), queue.clone(), origin)),
            network,
            queue,
            store,
            publisher,
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_get_is_forwarded_with_query() {
        let mut fx = fixture();
        fx.network.respond(
            Method::GET,
            "https://app.example/api/search?q=boats",
            HttpResponse::json(StatusCode::OK, &json!(["dinghy"])),
        );
        let app = app(fx.state.take().unwrap());

        let response = app.oneshot(get("/api/search?q=boats")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!(["dinghy"]));
    }

    #[tokio::test]
    async fn test_offline_api_read_serves_cache() {
        let mut fx = fixture();
        fx.network.respond(
            Method::GET,
            "https://app.example/api/feed",
            HttpResponse::json(StatusCode::OK, &json!({ "items": [1, 2] })),
        );
        let app = app(fx.state.take().unwrap());

        let online = app.clone().oneshot(get("/api/feed")).await.unwrap();
        assert_eq!(online.status(), StatusCode::OK);

        fx.network.set_online(false);
        let offline = app.oneshot(get("/api/feed")).await.unwrap();
        assert_eq!(offline.status(), StatusCode::OK);
        assert_eq!(body_json(offline).await, json!({ "items": [1, 2] }));
    }

    #[tokio::test]
    async fn test_offline_mutation_is_queued() {
        let mut fx = fixture();
        fx.network.set_online(false);
        let app = app(fx.state.take().unwrap());

        let response = app
            .oneshot(post("/api/posts", r#"{"title":"ahoy"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let id = body_json(response).await["queued"].as_i64().unwrap();

        let queued = fx.queue.list_all().await;
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert_eq!(queued[0].method, "POST");
        assert_eq!(queued[0].url, "https://app.example/api/posts");
        assert_eq!(queued[0].body, json!({ "title": "ahoy" }));
    }

    #[tokio::test]
    async fn test_mutation_while_offline_waits_behind_queue() {
        let mut fx = fixture();
        fx.network
            .respond_status(Method::POST, "https://app.example/api/posts", StatusCode::CREATED);
        let earlier = fx
            .queue
            .enqueue(
                Method::POST,
                Url::parse("https://app.example/api/posts").unwrap(),
                json!({ "title": "first" }),
            )
            .await
            .unwrap();
        let (tx, rx) = watch::channel(ConnectivityState::Offline);
        let app = app(fx.state.take().unwrap().with_connectivity(rx));

        let response = app
            .clone()
            .oneshot(post("/api/posts", r#"{"title":"second"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(fx.network.requests().is_empty());
        let queued = fx.queue.list_all().await;
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, earlier);
        assert_eq!(queued[1].body, json!({ "title": "second" }));

        tx.send(ConnectivityState::Online).unwrap();
        let response = app.oneshot(post("/api/posts", "{}")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(fx.network.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_events_stream_activations() {
        let mut fx = fixture();
        let app = app(fx.state.take().unwrap().with_events(fx.publisher.clone()));

        let response = app.oneshot(get(EVENTS_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        fx.store
            .activate(Some(CacheVersion::new("0").unwrap()))
            .await
            .unwrap();

        let mut body = response.into_body().into_data_stream();
        let chunk = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(text.contains("event: version"));
        let data = text.lines().find_map(|line| line.strip_prefix("data: ")).unwrap();
        let event: VersionEvent = serde_json::from_str(data).unwrap();
        assert_eq!(event.version, CacheVersion::new("1").unwrap());
        assert_eq!(event.previous, Some(CacheVersion::new("0").unwrap()));
    }

    #[tokio::test]
    async fn test_closing_ends_event_streams() {
        let mut fx = fixture();
        let state = Arc::new(fx.state.take().unwrap().with_events(fx.publisher.clone()));
        let app = routes(state.clone());

        let response = app.oneshot(get(EVENTS_PATH)).await.unwrap();
        state.close_streams();

        let mut body = response.into_body().into_data_stream();
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_events_unavailable_without_publisher() {
        let mut fx = fixture();
        let app = app(fx.state.take().unwrap());

        let response = app.oneshot(get(EVENTS_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_online_mutation_passes_through() {
        let mut fx = fixture();
        fx.network.respond(
            Method::POST,
            "https://app.example/api/posts",
            HttpResponse::json(StatusCode::CREATED, &json!({ "id": 9 })),
        );
        let app = app(fx.state.take().unwrap());

        let response = app
            .oneshot(post("/api/posts", r#"{"title":"ahoy"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await, json!({ "id": 9 }));
        assert!(fx.queue.list_all().await.is_empty());

        let sent = fx.network.requests();
        assert!(sent[0].headers.get(header::HOST).is_none());
        assert_eq!(sent[0].body.as_deref(), Some(&br#"{"title":"ahoy"}"#[..]));
    }

    #[tokio::test]
    async fn test_rejected_mutation_is_not_queued() {
        let mut fx = fixture();
        fx.network
            .respond_status(Method::POST, "https://app.example/api/posts", StatusCode::BAD_REQUEST);
        let app = app(fx.state.take().unwrap());

        let response = app.oneshot(post("/api/posts", "{}")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(fx.queue.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_non_json_mutation_fails() {
        let mut fx = fixture();
        fx.network.set_online(false);
        let app = app(fx.state.take().unwrap());

        let response = app.oneshot(post("/api/upload", "not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(fx.queue.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_offline_page() {
        let mut fx = fixture();
        fx.network.set_online(false);
        let app = app(fx.state.take().unwrap());

        let request = Request::builder()
            .uri("/settings")
            .header(header::ACCEPT, "text/html")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_health_and_queue_endpoints() {
        let mut fx = fixture();
        fx.queue
            .enqueue(
                Method::DELETE,
                Url::parse("https://app.example/api/posts/3").unwrap(),
                Value::Null,
            )
            .await
            .unwrap();
        let (_tx, rx) = watch::channel(ConnectivityState::Offline);
        let app = app(fx.state.take().unwrap().with_connectivity(rx));

        let health = body_json(app.clone().oneshot(get(HEALTH_PATH)).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["cache_version"], "1");
        assert_eq!(health["queued"], 1);
        assert_eq!(health["connectivity"], "offline");

        let listing = body_json(app.oneshot(get(QUEUE_PATH)).await.unwrap()).await;
        assert_eq!(listing[0]["method"], "DELETE");
        assert_eq!(listing[0]["url"], "https://app.example/api/posts/3");
        assert!(fx.network.requests().is_empty());
    }
}
