//! Lazily opened SQLite connection shared by the cache and queue stores.
//!
//! The database file and its schema are created on first use, not at
//! construction, and every statement runs on the blocking thread pool so
//! storage access never stalls the async runtime. Several processes may
//! open the same file; WAL mode plus a busy timeout lets them interleave.

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Error, Result};

/// How long a writer waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MEMORY_PATH: &str = ":memory:";

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// A SQLite connection opened on first access.
#[derive(Clone)]
pub struct LazyConnection {
    path: PathBuf,
    schema: &'static str,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl LazyConnection {
    /// Describe a database at `path` with the given schema batch.
    ///
    /// The schema must be idempotent (`CREATE ... IF NOT EXISTS`); it runs
    /// every time a process opens the file.
    pub fn new(path: impl AsRef<Path>, schema: &'static str) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            schema,
            conn: Arc::new(Mutex::new(None)),
        }
    }

    /// A private in-memory database (for testing).
    pub fn in_memory(schema: &'static str) -> Self {
        Self::new(MEMORY_PATH, schema)
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the connection on the blocking pool, opening the
    /// database and applying the schema first if needed.
    pub async fn with<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let path = self.path.clone();
        let schema = self.schema;

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("Connection lock poisoned".to_string()))?;

            if guard.is_none() {
                *guard = Some(open(&path, schema)?);
            }

            match guard.as_mut() {
                Some(conn) => f(conn),
                None => Err(Error::Storage("Connection unavailable".to_string())),
            }
        })
        .await
        .map_err(|e| Error::Storage(format!("Storage task failed: {}", e)))?
    }
}

fn open(path: &Path, schema: &str) -> Result<Connection> {
    let in_memory = path.as_os_str() == MEMORY_PATH;

    if !in_memory {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if !in_memory {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("SQLite journal mode for {}: {}", path.display(), mode);
    }
    conn.execute_batch(schema)?;

    info!("Opened database {}", path.display());
    Ok(conn)
}
