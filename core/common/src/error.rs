//! Common error types for Harbor.

use thiserror::Error;

/// Top-level error type for Harbor operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The network could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// A network call did not complete in time.
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The remote answered with a non-success status.
    #[error("HTTP status {status}: {url}")]
    Http { status: u16, url: String },

    /// Durable storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration is missing or malformed.
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    ///
    /// Client errors other than request timeout (408) and rate limiting
    /// (429) are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Io(_) => true,
            Error::Http { status, .. } => !(400..500).contains(status) || matches!(status, 408 | 429),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("refused".into()).is_transient());
        assert!(Error::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(Error::Http { status: 503, url: "x".into() }.is_transient());
        assert!(Error::Http { status: 429, url: "x".into() }.is_transient());
        assert!(!Error::Http { status: 404, url: "x".into() }.is_transient());
        assert!(!Error::Storage("disk".into()).is_transient());
    }
}
