//! Durable store: connection management, schema migration, and the
//! per-state-dir singleton cache.
//!
//! One SQLite file per state directory, opened in WAL mode with
//! `synchronous=NORMAL`. If the configured path cannot be opened the store
//! falls back to an in-memory instance cached under the same path — reads
//! and writes still succeed, but crash recovery is inoperative until the
//! process restarts with a writable path.

use crate::error::{DbError, Result};
use futures::future::BoxFuture;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::sync::Mutex;

/// Lifecycle database file name inside the state directory.
pub const DB_FILE_NAME: &str = "message-lifecycle.db";

/// Open stores, keyed by the resolved state directory. The fallback
/// in-memory instance is cached under the same key so repeated opens of an
/// unwritable path share one store.
static OPEN_STORES: LazyLock<Mutex<HashMap<PathBuf, MessageDb>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Current wall clock in epoch milliseconds. All lifecycle timestamps use
/// this resolution so backoff arithmetic stays exact.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the lifecycle database.
#[derive(Debug, Clone)]
pub struct MessageDb {
    pool: SqlitePool,
    in_memory_fallback: bool,
}

impl MessageDb {
    /// Open (or reuse) the lifecycle store for a state directory.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        let key = state_dir.to_path_buf();
        let mut stores = OPEN_STORES.lock().await;
        if let Some(db) = stores.get(&key) {
            return Ok(db.clone());
        }

        let db = match Self::open_on_disk(state_dir).await {
            Ok(db) => db,
            Err(error) => {
                tracing::warn!(
                    %error,
                    state_dir = %state_dir.display(),
                    "failed to open message-lifecycle.db, falling back to in-memory store; \
                     crash recovery is inoperative until restart with a writable path"
                );
                Self::open_in_memory().await?
            }
        };

        stores.insert(key, db.clone());
        Ok(db)
    }

    async fn open_on_disk(state_dir: &Path) -> Result<Self, DbError> {
        std::fs::create_dir_all(state_dir).map_err(DbError::StateDir)?;

        let options = SqliteConnectOptions::new()
            .filename(state_dir.join(DB_FILE_NAME))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(DbError::Open)?;
        schema(&pool).await?;

        Ok(Self {
            pool,
            in_memory_fallback: false,
        })
    }

    /// Open a standalone in-memory store. A single pooled connection is
    /// required: every additional in-memory connection would see its own
    /// empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(DbError::Open)?;
        schema(&pool).await?;

        Ok(Self {
            pool,
            in_memory_fallback: true,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether this store lost its disk backing and recovery is inoperative.
    pub fn is_in_memory_fallback(&self) -> bool {
        self.in_memory_fallback
    }

    /// Run `f` inside a write transaction. The transaction commits when `f`
    /// returns `Ok` and rolls back on any fault.
    pub async fn write_txn<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Transaction<'static, Sqlite>) -> BoxFuture<'c, Result<T>>,
    {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;
        let out = f(&mut tx).await?;
        tx.commit().await.map_err(DbError::Query)?;
        Ok(out)
    }
}

/// Apply schema migrations. Idempotent: already-applied migrations are
/// skipped via the sqlx migrations table.
pub async fn schema(pool: &SqlitePool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(DbError::Migrate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_is_a_singleton_per_state_dir() {
        let dir = tempfile::tempdir().expect("temp dir should be created");
        let first = MessageDb::open(dir.path())
            .await
            .expect("open should succeed");
        let second = MessageDb::open(dir.path())
            .await
            .expect("reopen should succeed");

        // Same underlying pool: a write through one handle is visible
        // through the other without reopening the file.
        sqlx::query(
            "INSERT INTO message_turns (id, channel, payload, accepted_at, updated_at) \
             VALUES ('t1', 'telegram', '{}', 0, 0)",
        )
        .execute(first.pool())
        .await
        .expect("insert should succeed");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_turns")
            .fetch_one(second.pool())
            .await
            .expect("count should succeed");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn schema_is_idempotent() {
        let db = MessageDb::open_in_memory()
            .await
            .expect("open should succeed");
        schema(db.pool())
            .await
            .expect("second migration run should be a no-op");
    }

    #[tokio::test]
    async fn write_txn_rolls_back_on_error() {
        let db = MessageDb::open_in_memory()
            .await
            .expect("open should succeed");

        let result: Result<()> = db
            .write_txn(|tx| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO message_turns (id, channel, payload, accepted_at, updated_at) \
                         VALUES ('t1', 'telegram', '{}', 0, 0)",
                    )
                    .execute(&mut **tx)
                    .await
                    .map_err(crate::error::Error::from)?;
                    Err(anyhow::anyhow!("synthetic fault").into())
                })
            })
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM message_turns")
            .fetch_one(db.pool())
            .await
            .expect("count should succeed");
        assert_eq!(count, 0, "rolled-back insert must not be visible");
    }
}
