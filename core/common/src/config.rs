//! Harbor configuration.
//!
//! Configuration is a JSON document. Every field has a default, so a partial
//! file (or none at all) yields a usable setup.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::{CacheVersion, Error, Result};

/// Request classification rules used by the strategy router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRules {
    /// Path prefix under which static assets are served.
    pub assets_prefix: String,
    /// Path prefix of the backend API.
    pub api_prefix: String,
    /// File extensions (lowercase, no dot) treated as static images.
    pub image_extensions: Vec<String>,
}

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            assets_prefix: "/assets/".to_string(),
            api_prefix: "/api/".to_string(),
            image_extensions: ["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Replay retry and dead-letter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Failed attempts after which a mutation is dead-lettered. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Cap on the backoff delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add +/- 25% jitter to delays.
    pub jitter: bool,
    /// Move mutations rejected with a permanent client error straight to dead letters.
    pub dead_letter_client_errors: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay_ms: 1_000,
            max_delay_ms: 5 * 60 * 1_000,
            backoff_multiplier: 2.0,
            jitter: true,
            dead_letter_client_errors: true,
        }
    }
}

/// Connectivity probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// URL polled to decide whether the network is reachable.
    /// Defaults to the origin root when unset.
    pub url: Option<Url>,
    /// Polling interval, in seconds.
    pub interval_secs: u64,
    /// Timeout for one probe, in seconds.
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_secs: 15,
            timeout_secs: 5,
        }
    }
}

/// Top-level Harbor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    /// Deployment version owning the active cache namespaces.
    pub version: String,
    /// Upstream origin that requests are forwarded to.
    pub origin: Url,
    /// Request classification rules.
    pub routes: RouteRules,
    /// Paths (relative to the origin) pre-cached at install.
    pub manifest: Vec<String>,
    /// Directory holding the cache and queue databases.
    pub data_dir: PathBuf,
    /// Timeout for proxied requests and manifest fetches, in seconds.
    pub request_timeout_secs: u64,
    /// Per-replay timeout, in seconds.
    pub replay_timeout_secs: u64,
    /// Replay retry policy.
    pub retry: RetrySettings,
    /// Connectivity probe.
    pub probe: ProbeConfig,
    /// Address the proxy listens on.
    pub listen: SocketAddr,
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            origin: Url::parse("http://127.0.0.1:3000/").expect("static origin URL is valid"),
            routes: RouteRules::default(),
            manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/assets/logo.png".to_string(),
            ],
            data_dir: default_data_dir(),
            request_timeout_secs: 10,
            replay_timeout_secs: 30,
            retry: RetrySettings::default(),
            probe: ProbeConfig::default(),
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl HarborConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// - File unreadable
    /// - Malformed JSON
    /// - Values rejected by [`HarborConfig::validate`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.cache_version()?;
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "Origin must be http or https, got {}",
                self.origin
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.replay_timeout_secs == 0 {
            return Err(Error::Config("replay_timeout_secs must be positive".to_string()));
        }
        if self.manifest.iter().any(|p| p.is_empty()) {
            return Err(Error::Config("Manifest paths cannot be empty".to_string()));
        }
        if !self.routes.api_prefix.starts_with('/') || !self.routes.assets_prefix.starts_with('/') {
            return Err(Error::Config("Route prefixes must start with '/'".to_string()));
        }
        Ok(())
    }

    /// Active cache version.
    pub fn cache_version(&self) -> Result<CacheVersion> {
        CacheVersion::new(self.version.clone())
    }

    /// Manifest entries resolved against the origin.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.manifest
            .iter()
            .map(|p| {
                self.origin
                    .join(p)
                    .map_err(|e| Error::Config(format!("Invalid manifest path {}: {}", p, e)))
            })
            .collect()
    }

    /// Timeout for interactive traffic.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Per-replay timeout.
    pub fn replay_timeout(&self) -> Duration {
        Duration::from_secs(self.replay_timeout_secs)
    }

    /// Path of the response cache database.
    pub fn cache_db_path(&self) -> PathBuf {
        self.data_dir.join("cache.db")
    }

    /// Path of the mutation queue database.
    pub fn queue_db_path(&self) -> PathBuf {
        self.data_dir.join("queue.db")
    }

    /// URL polled by the connectivity probe.
    pub fn probe_url(&self) -> Url {
        self.probe.url.clone().unwrap_or_else(|| self.origin.clone())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("harbor")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = HarborConfig::default();
        config.validate().unwrap();
        assert_eq!(config.manifest_urls().unwrap().len(), 3);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harbor.json");
        std::fs::write(&path, r#"{ "version": "7", "routes": { "api_prefix": "/v2/" } }"#).unwrap();

        let config = HarborConfig::load(&path).unwrap();
        assert_eq!(config.version, "7");
        assert_eq!(config.routes.api_prefix, "/v2/");
        assert_eq!(config.routes.assets_prefix, "/assets/");
        assert_eq!(config.replay_timeout_secs, 30);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harbor.json");
        let mut config = HarborConfig::default();
        config.version = "2024.10".to_string();
        config.save(&path).unwrap();

        assert_eq!(HarborConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HarborConfig::default();
        config.replay_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = HarborConfig::default();
        config.request_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = HarborConfig::default();
        config.origin = Url::parse("ftp://files.example/").unwrap();
        assert!(config.validate().is_err());

        let mut config = HarborConfig::default();
        config.version = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_manifest_urls_resolve_against_origin() {
        let mut config = HarborConfig::default();
        config.origin = Url::parse("https://app.example/").unwrap();
        let urls = config.manifest_urls().unwrap();
        assert_eq!(urls[2].as_str(), "https://app.example/assets/logo.png");
    }
}
