//! SQLite-backed response cache.
//!
//! Persists cached responses on device so they survive restarts and can be
//! shared by every interception context that opens the same file.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use tracing::debug;

use harbor_common::{HttpResponse, LazyConnection, RequestKey, Result};

use crate::backend::CacheBackend;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS cache_namespaces (
        name TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS cache_entries (
        namespace TEXT NOT NULL,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        status INTEGER NOT NULL,
        headers TEXT NOT NULL,
        body BLOB NOT NULL,
        stored_at TEXT NOT NULL,
        PRIMARY KEY (namespace, method, url)
    );

    CREATE TABLE IF NOT EXISTS cache_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const ACTIVE_VERSION_KEY: &str = "active_version";

/// Cache backend using SQLite.
#[derive(Clone)]
pub struct SqliteBackend {
    db: LazyConnection,
}

impl SqliteBackend {
    /// Describe a cache database at `db_path`.
    ///
    /// Nothing touches the disk until the first operation.
    pub fn open(db_path: impl AsRef<Path>) -> Self {
        Self {
            db: LazyConnection::new(db_path, SCHEMA),
        }
    }

    /// Create an in-memory cache (for testing).
    pub fn in_memory() -> Self {
        Self {
            db: LazyConnection::in_memory(SCHEMA),
        }
    }
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM cache_namespaces ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(names)
            })
            .await
    }

    async fn open(&self, namespace: &str) -> Result<()> {
        let namespace = namespace.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?1, ?2)",
                    params![namespace, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<HttpResponse>> {
        let namespace = namespace.to_string();
        let key = key.clone();
        self.db
            .with(move |conn| {
                let row = conn
                    .query_row(
                        r#"
                        SELECT status, headers, body FROM cache_entries
                        WHERE namespace = ?1 AND method = ?2 AND url = ?3
                        "#,
                        params![namespace, key.method, key.url],
                        |row| {
                            Ok((
                                row.get::<_, u16>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, Vec<u8>>(2)?,
                            ))
                        },
                    )
                    .optional()?;

                match row {
                    Some((status, headers, body)) => {
                        let headers: Vec<(String, String)> = serde_json::from_str(&headers)?;
                        Ok(Some(HttpResponse::from_parts(status, headers, body)?))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    async fn put(&self, namespace: &str, key: &RequestKey, response: &HttpResponse) -> Result<()> {
        debug!("Caching {} in {}", key, namespace);
        let namespace = namespace.to_string();
        let key = key.clone();
        let status = response.status.as_u16();
        let headers = serde_json::to_string(&response.header_pairs())?;
        let body = response.body.to_vec();

        self.db
            .with(move |conn| {
                let now = Utc::now().to_rfc3339();
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO cache_namespaces (name, created_at) VALUES (?1, ?2)",
                    params![namespace, now],
                )?;
                tx.execute(
                    r#"
                    INSERT OR REPLACE INTO cache_entries
                    (namespace, method, url, status, headers, body, stored_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![namespace, key.method, key.url, status, headers, body, now],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<bool> {
        debug!("Deleting namespace {}", namespace);
        let namespace = namespace.to_string();
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM cache_entries WHERE namespace = ?1",
                    params![namespace],
                )?;
                let removed = tx.execute(
                    "DELETE FROM cache_namespaces WHERE name = ?1",
                    params![namespace],
                )?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
    }

    async fn active_version(&self) -> Result<Option<String>> {
        self.db
            .with(|conn| {
                let version: Option<String> = conn
                    .query_row(
                        "SELECT value FROM cache_meta WHERE key = ?1",
                        params![ACTIVE_VERSION_KEY],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(version)
            })
            .await
    }

    async fn set_active_version(&self, version: &str) -> Result<()> {
        let version = version.to_string();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_meta (key, value) VALUES (?1, ?2)",
                    params![ACTIVE_VERSION_KEY, version],
                )?;
                Ok(())
            })
            .await
    }
}
