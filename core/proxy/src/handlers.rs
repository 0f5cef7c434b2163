//! Request handlers.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{debug, warn};
use url::Url;

use harbor_cache::{BroadcastPublisher, CacheStrategyRouter, LifecycleState};
use harbor_common::{HttpRequest, HttpResponse};
use harbor_sync::{ConnectivityState, QueuedMutation, SyncQueue};

/// Server-sent event name for version activations.
pub const VERSION_EVENT: &str = "version";

/// Largest request body accepted from clients.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that only describe one hop and are never forwarded.
const HOP_BY_HOP: [header::HeaderName; 7] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHORIZATION,
    header::PROXY_AUTHENTICATE,
];

/// Shared proxy state.
pub struct ProxyState {
    router: Arc<CacheStrategyRouter>,
    queue: SyncQueue,
    origin: Url,
    connectivity: Option<watch::Receiver<ConnectivityState>>,
    events: Option<BroadcastPublisher>,
    /// Flips to true when the server shuts down; ends open event streams.
    closing: watch::Sender<bool>,
}

impl ProxyState {
    /// Create proxy state forwarding to `origin`.
    pub fn new(router: Arc<CacheStrategyRouter>, queue: SyncQueue, origin: Url) -> Self {
        Self {
            router,
            queue,
            origin,
            connectivity: None,
            events: None,
            closing: watch::Sender::new(false),
        }
    }

    /// Follow connectivity from `signals`.
    ///
    /// While it reads offline, mutations are queued without trying the
    /// network.
    pub fn with_connectivity(mut self, signals: watch::Receiver<ConnectivityState>) -> Self {
        self.connectivity = Some(signals);
        self
    }

    /// Stream version activations announced on `publisher` to clients.
    pub fn with_events(mut self, publisher: BroadcastPublisher) -> Self {
        self.events = Some(publisher);
        self
    }

    /// End every open event stream.
    pub(crate) fn close_streams(&self) {
        self.closing.send_replace(true);
    }

    fn is_offline(&self) -> bool {
        self.connectivity
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == ConnectivityState::Offline)
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache_version: String,
    pub cache_state: LifecycleState,
    pub queued: usize,
    pub connectivity: Option<ConnectivityState>,
}

/// Health check endpoint
pub async fn health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    let store = state.router.store();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_version: store.version().to_string(),
        cache_state: store.state(),
        queued: state.queue.list_all().await.len(),
        connectivity: state.connectivity.as_ref().map(|rx| *rx.borrow()),
    })
}

/// Pending mutations, oldest first.
pub async fn queue(State(state): State<Arc<ProxyState>>) -> Json<Vec<QueuedMutation>> {
    Json(state.queue.list_all().await)
}

/// Version activations as server-sent events.
///
/// Each event carries the activated version as JSON. Clients that derived
/// state from an older version should discard it when one arrives.
pub async fn events(State(state): State<Arc<ProxyState>>) -> Response {
    let Some(publisher) = &state.events else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let stream = stream::unfold(publisher.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let sse = Event::default().event(VERSION_EVENT).json_data(&event);
                    return Some((sse, rx));
                }
                Err(RecvError::Lagged(missed)) => {
                    debug!("Event subscriber skipped {} activations", missed)
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let mut closing = state.closing.subscribe();
    let stream = stream.take_until(async move {
        let _ = closing.wait_for(|closed| *closed).await;
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Proxy any other request to the origin.
pub async fn proxy(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let request = match to_http_request(&state.origin, request).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    if request.method == Method::GET {
        return into_response(state.router.handle(request).await);
    }

    // Keep replay order: nothing overtakes queued mutations while offline.
    if !request.method.is_safe() && state.is_offline() {
        return queue_mutation(&state, request, "network offline").await;
    }

    match state.router.forward(&request).await {
        Ok(response) => into_response(response),
        Err(e) if !request.method.is_safe() => queue_mutation(&state, request, e).await,
        Err(e) => {
            debug!("{} {} failed: {}", request.method, request.url, e);
            into_response(HttpResponse::offline_api(&request.url))
        }
    }
}

/// Queue a mutation that could not reach the origin.
async fn queue_mutation(state: &ProxyState, request: HttpRequest, reason: impl Display) -> Response {
    let body = match request.body.as_deref() {
        None | Some([]) => serde_json::Value::Null,
        Some(bytes) => match serde_json::from_slice(bytes) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Cannot queue {} {}: body is not JSON ({})",
                    request.method, request.url, e
                );
                return into_response(HttpResponse::offline_api(&request.url));
            }
        },
    };

    debug!("{} {} unreachable ({}), queueing", request.method, request.url, reason);
    match state
        .queue
        .enqueue(request.method.clone(), request.url.clone(), body)
        .await
    {
        Some(id) => (StatusCode::ACCEPTED, Json(json!({ "queued": id }))).into_response(),
        None => into_response(HttpResponse::offline_api(&request.url)),
    }
}

async fn to_http_request(origin: &Url, request: Request) -> Result<HttpRequest, Response> {
    let (parts, body) = request.into_parts();

    let mut url = origin.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response())?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    let mut forwarded = HttpRequest::new(parts.method, url);
    forwarded.headers = headers;
    if !body.is_empty() {
        forwarded = forwarded.with_body(body);
    }
    Ok(forwarded)
}

fn into_response(response: HttpResponse) -> Response {
    let mut headers = response.headers;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = headers;
    out
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}
