//! Common types used throughout Harbor.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Deployment version that owns a set of cache namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVersion(String);

impl CacheVersion {
    /// Create a new version label.
    ///
    /// # Errors
    /// - Returns error if the label is empty or contains whitespace
    pub fn new(version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Cache version cannot be empty".to_string(),
            ));
        }
        if version.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Cache version cannot contain whitespace: {:?}",
                version
            )));
        }
        Ok(Self(version))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical cache bucket. Each bucket has exactly one active namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Static assets and navigation documents.
    Static,
    /// Backend API GET responses.
    Api,
}

impl Bucket {
    /// All buckets, in a fixed order.
    pub const ALL: [Bucket; 2] = [Bucket::Static, Bucket::Api];

    /// Name used as the namespace prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Static => "static",
            Bucket::Api => "api",
        }
    }
}

/// A named, versioned cache namespace, rendered as `<bucket>-v<version>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId {
    pub bucket: Bucket,
    pub version: CacheVersion,
}

impl NamespaceId {
    /// Create a namespace identifier for a bucket and version.
    pub fn new(bucket: Bucket, version: CacheVersion) -> Self {
        Self { bucket, version }
    }

    /// Parse a namespace identifier.
    ///
    /// Returns `None` for identifiers that do not follow the
    /// `<bucket>-v<version>` scheme; those belong to someone else.
    pub fn parse(id: &str) -> Option<Self> {
        Bucket::ALL.iter().find_map(|bucket| {
            let version = id.strip_prefix(bucket.name())?.strip_prefix("-v")?;
            CacheVersion::new(version)
                .ok()
                .map(|version| Self::new(*bucket, version))
        })
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-v{}", self.bucket.name(), self.version)
    }
}

/// Cache key: request method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of the given URL.
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// An outgoing or intercepted HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Create a request without headers or body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach a JSON body and the matching content type.
    pub fn with_json(self, body: &serde_json::Value) -> crate::Result<Self> {
        let bytes = serde_json::to_vec(body)?;
        Ok(self
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(bytes))
    }

    /// Whether the client asked for an HTML document.
    pub fn accepts_html(&self) -> bool {
        self.headers
            .get_all(ACCEPT)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.contains("text/html"))
    }

    /// Cache key for this request.
    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.to_string(),
            url: self.url.to_string(),
        }
    }
}

/// A response returned by the network or served from cache.
///
/// The body is reference counted, so cloning a response for the cache never
/// consumes the copy handed back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response with no headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Create a JSON response.
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        Self::new(status, body.to_string())
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
    }

    /// Structured 503 returned for API requests that have no cached fallback.
    pub fn offline_api(url: &Url) -> Self {
        Self::json(
            StatusCode::SERVICE_UNAVAILABLE,
            &serde_json::json!({
                "error": "offline",
                "message": "Network unavailable and no cached response exists",
                "url": url.as_str(),
            }),
        )
    }

    /// Minimal 503 document for navigations that have no cached fallback.
    pub fn offline_page() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "<!doctype html><title>Offline</title><h1>You are offline</h1>",
        )
        .with_header(
            CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Headers as string pairs, skipping values that are not valid UTF-8.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect()
    }

    /// Rebuild a response from its stored parts.
    pub fn from_parts(
        status: u16,
        headers: Vec<(String, String)>,
        body: impl Into<Bytes>,
    ) -> crate::Result<Self> {
        let status = StatusCode::from_u16(status)
            .map_err(|e| crate::Error::Serialization(format!("Invalid status {}: {}", status, e)))?;
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| crate::Error::Serialization(e.to_string()))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| crate::Error::Serialization(e.to_string()))?;
            map.append(name, value);
        }
        Ok(Self {
            status,
            headers: map,
            body: body.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cache_version_rejects_empty() {
        assert!(CacheVersion::new("").is_err());
        assert!(CacheVersion::new("1 2").is_err());
        assert_eq!(CacheVersion::new("42").unwrap().as_str(), "42");
    }

    #[test]
    fn test_namespace_display() {
        let ns = NamespaceId::new(Bucket::Static, CacheVersion::new("3").unwrap());
        assert_eq!(ns.to_string(), "static-v3");
    }

    #[test]
    fn test_namespace_parse_foreign() {
        assert!(NamespaceId::parse("images").is_none());
        assert!(NamespaceId::parse("static-").is_none());
        assert!(NamespaceId::parse("static-v").is_none());
        assert!(NamespaceId::parse("workbox-precache-v2").is_none());
    }

    #[test]
    fn test_namespace_parse_dashed_version() {
        let ns = NamespaceId::parse("api-v2024-01-build-v9").unwrap();
        assert_eq!(ns.bucket, Bucket::Api);
        assert_eq!(ns.version.as_str(), "2024-01-build-v9");
    }

    #[test]
    fn test_accepts_html() {
        let url = Url::parse("https://app.example/").unwrap();
        let req = HttpRequest::get(url.clone()).with_header(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert!(req.accepts_html());
        assert!(!HttpRequest::get(url).accepts_html());
    }

    #[test]
    fn test_offline_api_body() {
        let url = Url::parse("https://app.example/api/posts").unwrap();
        let resp = HttpResponse::offline_api(&url);
        assert_eq!(resp.status, StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body["error"], "offline");
        assert_eq!(body["url"], "https://app.example/api/posts");
    }

    #[test]
    fn test_response_parts_restore_headers() {
        let resp = HttpResponse::new(StatusCode::OK, "hi")
            .with_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let restored =
            HttpResponse::from_parts(200, resp.header_pairs(), resp.body.clone()).unwrap();
        assert_eq!(restored, resp);
    }

    proptest! {
        #[test]
        fn namespace_ids_parse_back(version in "[A-Za-z0-9._-]{1,24}") {
            for bucket in Bucket::ALL {
                let ns = NamespaceId::new(bucket, CacheVersion::new(version.clone()).unwrap());
                prop_assert_eq!(NamespaceId::parse(&ns.to_string()), Some(ns));
            }
        }
    }
}
