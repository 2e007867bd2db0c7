//! SQLite store: connection, schema and the durable write contract.
//!
//! Every mutating call goes through [`Database::write`], which commits before
//! returning. Transient SQLite failures (busy, locked, I/O) block and retry
//! with a fixed delay, bounded by the configured [`RetryPolicy`]. The wait
//! runs on the calling thread, so an interrupt raised through
//! [`Database::interrupt_handle`] is only seen between attempts.

use crate::error::{CrawlError, Result, RetryPolicy};
use rusqlite::{Connection, ErrorCode, Transaction};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS period (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    period_date TEXT NOT NULL UNIQUE,
    status INTEGER NOT NULL DEFAULT 1,
    lease_owner TEXT,
    lease_expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS brand (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    status INTEGER NOT NULL DEFAULT 1,
    lease_owner TEXT,
    lease_expires_at INTEGER
);
CREATE TABLE IF NOT EXISTS period_brand (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_id INTEGER NOT NULL REFERENCES period(id),
    brand_id INTEGER NOT NULL REFERENCES brand(id),
    UNIQUE (period_id, brand_id)
);
CREATE TABLE IF NOT EXISTS model (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    brand_id INTEGER NOT NULL REFERENCES brand(id),
    name TEXT NOT NULL,
    external_code TEXT,
    status INTEGER NOT NULL DEFAULT 1,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    UNIQUE (brand_id, name)
);
CREATE TABLE IF NOT EXISTS model_year (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    model_id INTEGER NOT NULL REFERENCES model(id),
    period_id INTEGER NOT NULL REFERENCES period(id),
    label TEXT NOT NULL,
    year TEXT NOT NULL,
    variant TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    UNIQUE (model_id, period_id, label)
);
CREATE TABLE IF NOT EXISTS observation (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    period_id INTEGER NOT NULL REFERENCES period(id),
    model_year_id INTEGER NOT NULL REFERENCES model_year(id),
    value REAL NOT NULL,
    recorded_at TEXT NOT NULL,
    UNIQUE (period_id, model_year_id)
);
CREATE TABLE IF NOT EXISTS population (
    period_id INTEGER NOT NULL,
    level TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    populated_at TEXT NOT NULL,
    PRIMARY KEY (period_id, level, parent_id)
);
CREATE INDEX IF NOT EXISTS idx_model_brand_status ON model(brand_id, status);
CREATE INDEX IF NOT EXISTS idx_model_year_scope ON model_year(model_id, period_id, status);
CREATE INDEX IF NOT EXISTS idx_period_brand_period ON period_brand(period_id);
";

/// Where a connection string points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Memory,
    File(PathBuf),
}

/// Parse `sqlite://<path>`, `sqlite::memory:`, `:memory:` or a bare path.
pub fn parse_connection_string(url: &str) -> Result<Target> {
    let url = url.trim();
    if url.is_empty() {
        return Err(CrawlError::Config("empty database connection string".into()));
    }
    if url == ":memory:" || url == "sqlite::memory:" || url == "sqlite://:memory:" {
        return Ok(Target::Memory);
    }
    let path = match url.strip_prefix("sqlite://") {
        Some(rest) => rest,
        None if url.contains("://") => {
            return Err(CrawlError::Config(format!(
                "unsupported database scheme in '{url}' (expected sqlite://)"
            )))
        }
        None => url.strip_prefix("sqlite:").unwrap_or(url),
    };
    if path.is_empty() {
        return Err(CrawlError::Config(format!("missing database path in '{url}'")));
    }
    Ok(Target::File(expand_home(path)))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Whether a failure may go away by waiting.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

/// The single store connection owned by the crawl.
pub struct Database {
    conn: Connection,
    retry: RetryPolicy,
    interrupted: Arc<AtomicBool>,
}

impl Database {
    /// Open (or create) the store behind a connection string.
    pub fn open(url: &str, retry: RetryPolicy) -> Result<Self> {
        let conn = match parse_connection_string(url)? {
            Target::Memory => Connection::open_in_memory()?,
            Target::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let conn = Connection::open(&path)?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            }
        };
        // Waiting on locks is the retry loop's job.
        conn.busy_timeout(Duration::ZERO)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        debug!("store ready: {url}");
        Ok(Self {
            conn,
            retry,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// In-memory store with no write delay.
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:", RetryPolicy::new(Duration::ZERO, 1))
    }

    /// Read access. Reads are not retried.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Flag that stops pending write retries once set.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Run `op` in a transaction and commit it durably.
    ///
    /// Transient failures block for the fixed delay and run `op` again from
    /// scratch; anything else is returned at once.
    pub fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.try_write(&op) {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if self.interrupted.load(Ordering::SeqCst) {
                        warn!("store write abandoned after {attempts} attempt(s): {e}");
                        return Err(CrawlError::Interrupted);
                    }
                    if !self.retry.allows(attempts) {
                        return Err(CrawlError::StoreUnavailable {
                            attempts,
                            source: e,
                        });
                    }
                    warn!(
                        "store write failed (attempt {attempts}): {e}; retrying in {}ms",
                        self.retry.delay.as_millis()
                    );
                    std::thread::sleep(self.retry.delay);
                }
                Err(e) => return Err(CrawlError::Store(e)),
            }
        }
    }

    fn try_write<T, F>(&self, op: &F) -> rusqlite::Result<T>
    where
        F: Fn(&Transaction<'_>) -> rusqlite::Result<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
