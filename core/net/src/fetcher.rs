//! Fetcher trait definition.

use async_trait::async_trait;
use std::time::Duration;

use harbor_common::{Error, HttpRequest, HttpResponse, Result};

/// Network primitive.
///
/// Mirrors the semantics of a browser `fetch`: a response with any status
/// code is `Ok`. Only transport failures (unreachable host, reset
/// connection, timeout) are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Get the fetcher name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Issue a request against the network.
    ///
    /// # Errors
    /// - `Error::Network` when the remote cannot be reached
    /// - `Error::Timeout` when the call does not complete in time
    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse>;

    /// Issue a request, giving up after `limit`.
    async fn fetch_within(&self, request: &HttpRequest, limit: Duration) -> Result<HttpResponse> {
        match tokio::time::timeout(limit, self.fetch(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit)),
        }
    }
}
