// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Export cursor persistence.
//!
//! Stores, per `(source, topic)`, the row offset of the next page the
//! exporter has not yet attempted. An interrupted export resumes from there
//! instead of republishing everything.
//!
//! ## Cursor Semantics
//!
//! The cursor only advances after every publish in a page has resolved
//! (success or reported failure), so it never skips a page that was not
//! attempted.
//!
//! ```text
//! fetch page @ 1500 → publish 500 records → all resolved → persist 2000
//!                     (crash here = re-export page 1500, duplicates are upserts)
//! ```
//!
//! Two exports sharing one cursor file can hit SQLITE_BUSY; cursor writes
//! back off and retry a few times before failing.

use crate::error::{ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Attempts per cursor statement while SQLite reports the file as busy.
const BUSY_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(10);
const BUSY_BACKOFF_CAP: Duration = Duration::from_millis(500);

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6).
fn is_busy(e: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = e else {
        return false;
    };
    match db_err.code() {
        Some(code) => matches!(code.as_ref(), "5" | "6"),
        None => db_err.message().to_lowercase().contains("database is locked"),
    }
}

/// Run a cursor statement, backing off while another writer holds the file.
async fn with_busy_retry<F, Fut, T>(statement: &str, mut run: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut backoff = BUSY_BACKOFF;
    let mut attempt = 1;
    loop {
        match run().await {
            Err(e) if attempt < BUSY_ATTEMPTS && is_busy(&e) => {
                warn!(statement, attempt, backoff_ms = backoff.as_millis() as u64, "Cursor database busy");
                crate::metrics::cursor_retries_total(statement);
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BUSY_BACKOFF_CAP);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Identify a source store without leaking its credentials.
///
/// `postgres://user:pw@db:5432/orders` becomes `db:5432/orders`.
pub fn source_key(url: &str) -> String {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let without_auth = without_scheme
        .rsplit_once('@')
        .map_or(without_scheme, |(_, rest)| rest);
    without_auth
        .split_once('?')
        .map_or(without_auth, |(base, _)| base)
        .to_string()
}

fn cache_key(source: &str, topic: &str) -> (String, String) {
    (source.to_string(), topic.to_string())
}

/// Persistent export offsets backed by SQLite.
///
/// Reads are served from an in-memory cache; writes go through to disk
/// immediately since they happen once per page.
pub struct CursorStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<(String, String), u64>>,
    path: String,
}

impl CursorStore {
    /// Open (or create) the cursor database at `path`.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Initializing export cursor store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS export_cursors (
                source TEXT NOT NULL,
                topic TEXT NOT NULL,
                next_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (source, topic)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, i64)> =
            sqlx::query_as("SELECT source, topic, next_offset FROM export_cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (source, topic, offset) in rows {
            debug!(source = %source, topic = %topic, offset, "Loaded export cursor from disk");
            cache.insert((source, topic), offset.max(0) as u64);
        }
        if !cache.is_empty() {
            info!(count = cache.len(), "Restored export cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            path: path_str,
        })
    }

    /// Next unattempted offset, or `None` if this export never ran.
    pub async fn get(&self, source: &str, topic: &str) -> Option<u64> {
        self.cache.read().await.get(&cache_key(source, topic)).copied()
    }

    /// Persist the next unattempted offset.
    pub async fn set(&self, source: &str, topic: &str, next_offset: u64) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let offset = i64::try_from(next_offset)
            .map_err(|_| ReplicationError::Internal(format!("offset {} overflows i64", next_offset)))?;
        let pool = &self.pool;

        let result = with_busy_retry("cursor_set", || async move {
            sqlx::query(
                r#"
                INSERT INTO export_cursors (source, topic, next_offset, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(source, topic) DO UPDATE SET
                    next_offset = excluded.next_offset,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(source)
            .bind(topic)
            .bind(offset)
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_cursor_persist(topic, result.is_ok());
        result?;

        self.cache
            .write()
            .await
            .insert(cache_key(source, topic), next_offset);
        debug!(source = %source, topic = %topic, next_offset, "Export cursor persisted");
        Ok(())
    }

    /// Forget an export's progress so the next run starts from its configured offset.
    pub async fn reset(&self, source: &str, topic: &str) -> Result<()> {
        self.cache.write().await.remove(&cache_key(source, topic));

        let pool = &self.pool;
        with_busy_retry("cursor_reset", || async move {
            sqlx::query("DELETE FROM export_cursors WHERE source = ? AND topic = ?")
                .bind(source)
                .bind(topic)
                .execute(pool)
                .await
        })
        .await?;

        info!(source = %source, topic = %topic, "Reset export cursor");
        Ok(())
    }

    /// Get all cursors (for diagnostics).
    pub async fn get_all(&self) -> HashMap<(String, String), u64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        with_busy_retry("cursor_checkpoint", || async move {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint the WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Export cursor store closed");
    }
}
