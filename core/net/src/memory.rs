//! In-memory fetcher for testing.

use async_trait::async_trait;
use http::{Method, StatusCode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use harbor_common::{Error, HttpRequest, HttpResponse, Result};

use crate::fetcher::Fetcher;

/// Scripted outcome for one route.
#[derive(Debug, Clone)]
enum Outcome {
    Respond(HttpResponse),
    Fail,
}

#[derive(Debug, Clone)]
struct Route {
    outcome: Outcome,
    delay: Option<Duration>,
}

/// In-memory fetcher.
///
/// Answers from a table of scripted routes keyed by method and URL, records
/// every request it sees and can be switched offline, in which case every
/// call fails with a network error. Unrouted requests get a 404.
#[derive(Clone, Default)]
pub struct MemoryFetcher {
    routes: Arc<RwLock<HashMap<(Method, String), Route>>>,
    requests: Arc<RwLock<Vec<HttpRequest>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryFetcher {
    /// Create a new online fetcher with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, method: Method, url: &str, route: Route) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((method, url.to_string()), route);
    }

    /// Answer `method url` with `response`.
    pub fn respond(&self, method: Method, url: &str, response: HttpResponse) {
        self.insert(
            method,
            url,
            Route {
                outcome: Outcome::Respond(response),
                delay: None,
            },
        );
    }

    /// Answer `method url` with `response` after `delay`.
    pub fn respond_after(&self, method: Method, url: &str, response: HttpResponse, delay: Duration) {
        self.insert(
            method,
            url,
            Route {
                outcome: Outcome::Respond(response),
                delay: Some(delay),
            },
        );
    }

    /// Answer `method url` with an empty body and `status`.
    pub fn respond_status(&self, method: Method, url: &str, status: StatusCode) {
        self.respond(method, url, HttpResponse::new(status, ""));
    }

    /// Make `method url` fail with a network error.
    pub fn fail(&self, method: Method, url: &str) {
        self.insert(
            method,
            url,
            Route {
                outcome: Outcome::Fail,
                delay: None,
            },
        );
    }

    /// Switch the simulated network on or off.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Whether the simulated network is up.
    pub fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests seen for `url`, any method.
    pub fn call_count(&self, url: &str) -> usize {
        self.requests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.url.as_str() == url)
            .count()
    }

    /// Forget recorded requests.
    pub fn clear_requests(&self) {
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        if !self.is_online() {
            return Err(Error::Network(format!("offline: {}", request.url)));
        }

        let route = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(request.method.clone(), request.url.to_string()))
            .cloned();

        let Some(route) = route else {
            return Ok(HttpResponse::new(StatusCode::NOT_FOUND, ""));
        };

        if let Some(delay) = route.delay {
            tokio::time::sleep(delay).await;
        }

        match route.outcome {
            Outcome::Respond(response) => Ok(response),
            Outcome::Fail => Err(Error::Network(format!(
                "connection refused: {}",
                request.url
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const URL: &str = "https://app.example/api/posts";

    #[tokio::test]
    async fn test_scripted_response() {
        let fetcher = MemoryFetcher::new();
        fetcher.respond(Method::GET, URL, HttpResponse::new(StatusCode::OK, "[]"));

        let response = fetcher
            .fetch(&HttpRequest::get(Url::parse(URL).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(&response.body[..], b"[]");
        assert_eq!(fetcher.call_count(URL), 1);
    }

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let fetcher = MemoryFetcher::new();
        fetcher.respond(Method::GET, URL, HttpResponse::new(StatusCode::OK, "[]"));
        fetcher.set_online(false);

        let err = fetcher
            .fetch(&HttpRequest::get(Url::parse(URL).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        // The attempt is still recorded.
        assert_eq!(fetcher.call_count(URL), 1);
    }

    #[tokio::test]
    async fn test_unrouted_is_not_found() {
        let fetcher = MemoryFetcher::new();
        let response = fetcher
            .fetch(&HttpRequest::new(Method::POST, Url::parse(URL).unwrap()))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_within_times_out() {
        let fetcher = MemoryFetcher::new();
        fetcher.respond_after(
            Method::GET,
            URL,
            HttpResponse::new(StatusCode::OK, ""),
            Duration::from_secs(60),
        );

        let err = fetcher
            .fetch_within(
                &HttpRequest::get(Url::parse(URL).unwrap()),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
