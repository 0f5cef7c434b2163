//! Durable queue of mutations waiting for replay.
//!
//! Mutations are appended in arrival order and keep that order across
//! restarts. A queued mutation is immutable: replay bookkeeping (attempt
//! count, next eligible time, last error) lives in a separate table keyed by
//! the mutation id, and an entry leaves the queue only when its replay is
//! confirmed or it is moved to the dead-letter table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::header::{HeaderName, HeaderValue};
use http::Method;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use harbor_common::{Error, HttpRequest, LazyConnection, Result};

/// Identifier of a queued mutation. Unique and increasing.
pub type MutationId = i64;

/// Header carrying the per-mutation idempotency key on replay.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS sync_queue (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        body TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        enqueued_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_attempts (
        mutation_id INTEGER PRIMARY KEY,
        attempts INTEGER NOT NULL,
        next_attempt_at TEXT NOT NULL,
        last_error TEXT
    );

    CREATE TABLE IF NOT EXISTS sync_dead_letters (
        id INTEGER PRIMARY KEY,
        method TEXT NOT NULL,
        url TEXT NOT NULL,
        body TEXT NOT NULL,
        idempotency_key TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        reason TEXT NOT NULL,
        dead_at TEXT NOT NULL
    );
"#;

/// A mutating request waiting to be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: MutationId,
    pub method: String,
    pub url: String,
    pub body: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    /// Sent with every replay so the endpoint can drop duplicates.
    pub idempotency_key: Uuid,
}

impl QueuedMutation {
    /// Build the replay request: JSON body, content type and idempotency key.
    pub fn to_request(&self) -> Result<HttpRequest> {
        let method = Method::from_bytes(self.method.as_bytes())
            .map_err(|e| Error::InvalidInput(format!("Invalid method {}: {}", self.method, e)))?;
        let url = Url::parse(&self.url)
            .map_err(|e| Error::InvalidInput(format!("Invalid URL {}: {}", self.url, e)))?;
        let key = HeaderValue::try_from(self.idempotency_key.to_string())
            .map_err(|e| Error::InvalidInput(e.to_string()))?;

        HttpRequest::new(method, url)
            .with_header(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), key)
            .with_json(&self.body)
    }
}

/// Replay bookkeeping for one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayRecord {
    /// Failed replays so far.
    pub attempts: u32,
    /// Replays before this time are skipped.
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A mutation given up on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub mutation: QueuedMutation,
    pub attempts: u32,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Durable storage for the mutation queue.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a mutation.
    ///
    /// # Errors
    /// - The method is not a mutating one (GET, HEAD, OPTIONS, TRACE)
    /// - Storage unavailable
    async fn enqueue(&self, method: &Method, url: &Url, body: &serde_json::Value)
        -> Result<QueuedMutation>;

    /// Every queued mutation in insertion order.
    async fn list_all(&self) -> Result<Vec<QueuedMutation>>;

    /// Delete one mutation. Returns whether it was present.
    async fn remove(&self, id: MutationId) -> Result<bool>;

    /// Replay bookkeeping for every mutation that has failed at least once.
    async fn replay_records(&self) -> Result<HashMap<MutationId, ReplayRecord>>;

    /// Record a failed replay.
    async fn record_failure(
        &self,
        id: MutationId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    /// Move a mutation to the dead-letter table after `attempts` failures.
    /// Returns whether it was present.
    async fn dead_letter(&self, id: MutationId, attempts: u32, reason: &str) -> Result<bool>;

    /// Every dead-lettered mutation, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;
}

/// Queue store using SQLite.
#[derive(Clone)]
pub struct SqliteQueue {
    db: LazyConnection,
}

impl SqliteQueue {
    /// Describe a queue database at `db_path`.
    ///
    /// The file and schema are created on first access.
    pub fn open(db_path: impl AsRef<Path>) -> Self {
        Self {
            db: LazyConnection::new(db_path, SCHEMA),
        }
    }

    /// Create an in-memory queue (for testing).
    pub fn in_memory() -> Self {
        Self {
            db: LazyConnection::in_memory(SCHEMA),
        }
    }

    /// Fetch a single mutation by id.
    pub async fn find(&self, id: MutationId) -> Result<Option<QueuedMutation>> {
        self.db
            .with(move |conn| {
                let row = conn
                    .query_row(
                        r#"
                        SELECT id, method, url, body, idempotency_key, enqueued_at
                        FROM sync_queue WHERE id = ?1
                        "#,
                        params![id],
                        MutationRow::from_row,
                    )
                    .optional()?;
                row.map(MutationRow::into_mutation).transpose()
            })
            .await
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("Invalid timestamp {}: {}", value, e)))
}

struct MutationRow {
    id: MutationId,
    method: String,
    url: String,
    body: String,
    idempotency_key: String,
    enqueued_at: String,
}

impl MutationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            method: row.get(1)?,
            url: row.get(2)?,
            body: row.get(3)?,
            idempotency_key: row.get(4)?,
            enqueued_at: row.get(5)?,
        })
    }

    fn into_mutation(self) -> Result<QueuedMutation> {
        Ok(QueuedMutation {
            id: self.id,
            method: self.method,
            url: self.url,
            body: serde_json::from_str(&self.body)?,
            enqueued_at: parse_time(&self.enqueued_at)?,
            idempotency_key: Uuid::parse_str(&self.idempotency_key)
                .map_err(|e| Error::Serialization(e.to_string()))?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueue {
    async fn enqueue(
        &self,
        method: &Method,
        url: &Url,
        body: &serde_json::Value,
    ) -> Result<QueuedMutation> {
        if method.is_safe() {
            return Err(Error::InvalidInput(format!(
                "{} is not a mutating method",
                method
            )));
        }

        let method = method.to_string();
        let url = url.to_string();
        let body_json = serde_json::to_string(body)?;
        let body = body.clone();
        let idempotency_key = Uuid::new_v4();
        let enqueued_at = Utc::now();

        self.db
            .with(move |conn| {
                conn.execute(
                    r#"
                    INSERT INTO sync_queue (method, url, body, idempotency_key, enqueued_at)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                    params![
                        method,
                        url,
                        body_json,
                        idempotency_key.to_string(),
                        enqueued_at.to_rfc3339()
                    ],
                )?;
                let id = conn.last_insert_rowid();
                debug!("Queued mutation {}: {} {}", id, method, url);

                Ok(QueuedMutation {
                    id,
                    method,
                    url,
                    body,
                    enqueued_at,
                    idempotency_key,
                })
            })
            .await
    }

    async fn list_all(&self) -> Result<Vec<QueuedMutation>> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, method, url, body, idempotency_key, enqueued_at
                    FROM sync_queue ORDER BY id
                    "#,
                )?;
                let rows = stmt
                    .query_map([], MutationRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows.into_iter().map(MutationRow::into_mutation).collect()
            })
            .await
    }

    async fn remove(&self, id: MutationId) -> Result<bool> {
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM sync_attempts WHERE mutation_id = ?1", params![id])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await
    }

    async fn replay_records(&self) -> Result<HashMap<MutationId, ReplayRecord>> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT mutation_id, attempts, next_attempt_at, last_error FROM sync_attempts",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, MutationId>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                rows.into_iter()
                    .map(|(id, attempts, next, last_error)| {
                        Ok((
                            id,
                            ReplayRecord {
                                attempts,
                                next_attempt_at: parse_time(&next)?,
                                last_error,
                            },
                        ))
                    })
                    .collect()
            })
            .await
    }

    async fn record_failure(
        &self,
        id: MutationId,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let error = error.to_string();
        self.db
            .with(move |conn| {
                // Only track mutations that are still queued.
                conn.execute(
                    r#"
                    INSERT OR REPLACE INTO sync_attempts (mutation_id, attempts, next_attempt_at, last_error)
                    SELECT id, ?2, ?3, ?4 FROM sync_queue WHERE id = ?1
                    "#,
                    params![id, attempts, next_attempt_at.to_rfc3339(), error],
                )?;
                Ok(())
            })
            .await
    }

    async fn dead_letter(&self, id: MutationId, attempts: u32, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        self.db
            .with(move |conn| {
                let tx = conn.transaction()?;
                let moved = tx.execute(
                    r#"
                    INSERT OR REPLACE INTO sync_dead_letters
                    (id, method, url, body, idempotency_key, enqueued_at, attempts, reason, dead_at)
                    SELECT id, method, url, body, idempotency_key, enqueued_at, ?2, ?3, ?4
                    FROM sync_queue WHERE id = ?1
                    "#,
                    params![id, attempts, reason, Utc::now().to_rfc3339()],
                )?;
                tx.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM sync_attempts WHERE mutation_id = ?1", params![id])?;
                tx.commit()?;
                Ok(moved > 0)
            })
            .await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT id, method, url, body, idempotency_key, enqueued_at,
                           attempts, reason, dead_at
                    FROM sync_dead_letters ORDER BY id
                    "#,
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            MutationRow::from_row(row)?,
                            row.get::<_, u32>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, String>(8)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;

                rows.into_iter()
                    .map(|(mutation, attempts, reason, dead_at)| {
                        Ok(DeadLetter {
                            mutation: mutation.into_mutation()?,
                            attempts,
                            reason,
                            dead_at: parse_time(&dead_at)?,
                        })
                    })
                    .collect()
            })
            .await
    }
}

/// The queue as seen by the calling layer.
///
/// Storage failures never reach the caller: they are logged and the call
/// degrades (an enqueue that cannot be persisted is lost, a listing that
/// cannot be read is empty, a removal that cannot be written is skipped).
#[derive(Clone)]
pub struct SyncQueue {
    store: Arc<dyn QueueStore>,
}

impl SyncQueue {
    /// Wrap a queue store.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    /// Open the SQLite queue at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(SqliteQueue::open(db_path)))
    }

    /// The underlying store, for callers that need error details.
    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    /// Register a mutation that could not reach the network.
    ///
    /// Returns the new id, or `None` if the mutation could not be persisted.
    pub async fn enqueue(
        &self,
        method: Method,
        url: Url,
        body: serde_json::Value,
    ) -> Option<MutationId> {
        match self.store.enqueue(&method, &url, &body).await {
            Ok(mutation) => {
                info!("Queued {} {} for replay as #{}", method, url, mutation.id);
                Some(mutation.id)
            }
            Err(e) => {
                error!("Mutation {} {} lost, queue unavailable: {}", method, url, e);
                None
            }
        }
    }

    /// Every queued mutation in insertion order.
    pub async fn list_all(&self) -> Vec<QueuedMutation> {
        match self.store.list_all().await {
            Ok(mutations) => mutations,
            Err(e) => {
                error!("Failed to read mutation queue: {}", e);
                Vec::new()
            }
        }
    }

    /// Remove a mutation. Removing an absent id is a no-op.
    pub async fn remove(&self, id: MutationId) {
        match self.store.remove(id).await {
            Ok(true) => debug!("Removed mutation #{}", id),
            Ok(false) => debug!("Mutation #{} already removed", id),
            Err(e) => error!("Failed to remove mutation #{}: {}", id, e),
        }
    }
}
