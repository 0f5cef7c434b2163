//! HTTP fetcher backed by reqwest.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use harbor_common::{Error, HttpRequest, HttpResponse, Result};

use crate::fetcher::Fetcher;

const USER_AGENT: &str = concat!("Harbor/", env!("CARGO_PKG_VERSION"));

/// Default timeout for a single request.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetcher that performs real HTTP calls.
#[derive(Clone)]
pub struct HttpFetcher {
    http: Client,
    timeout: Duration,
}

impl HttpFetcher {
    /// Create a fetcher with the default request timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a fetcher whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, timeout })
    }

    fn map_send_error(err: reqwest::Error, timeout_hint: Duration) -> Error {
        if err.is_timeout() {
            Error::Timeout(timeout_hint)
        } else {
            Error::Network(err.to_string())
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::map_send_error(e, self.timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::map_send_error(e, self.timeout))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let fetcher = HttpFetcher::with_timeout(Duration::from_secs(2)).unwrap();
        // Port 9 on localhost is the discard service; nothing listens there in CI.
        let request = HttpRequest::get(Url::parse("http://127.0.0.1:9/").unwrap());

        let err = fetcher.fetch(&request).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_name() {
        assert_eq!(HttpFetcher::new().unwrap().name(), "http");
    }
}
