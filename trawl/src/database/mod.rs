//! Persistence layer: SQLite via sqlx.
//!
//! Pool construction, migrations and the immediate-transaction wrapper used
//! by every multi-statement write.

pub mod manager;
pub mod models;

pub use manager::StateManager;
pub use models::{
    DownloadRecord, DownloadStatus, IntegrityReport, MetadataMap, MetadataValue, PostRecord,
    PostStatus, ResumeCounts, ResumeState, SessionRecord, SessionStatus,
};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Upper bound on pool size.
const MAX_POOL_SIZE: u32 = 10;

/// How long a connection waits on the SQLite write lock.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// Negative value means KB; 16MB page cache per connection.
const CACHE_SIZE_KB: i32 = -16_000;

/// Cap on WAL growth in bytes.
const JOURNAL_SIZE_LIMIT_BYTES: i64 = 32 * 1024 * 1024;

async fn apply_connection_pragmas(conn: &mut sqlx::SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("PRAGMA cache_size = {CACHE_SIZE_KB}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "PRAGMA journal_size_limit = {JOURNAL_SIZE_LIMIT_BYTES}"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Pool size scaled to the machine; SQLite gains little past a few readers.
pub fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_POOL_SIZE)
}

/// Initialize a connection pool with WAL mode and the standard pragmas.
///
/// `database_url` is a SQLite URL such as `sqlite:trawl.db?mode=rwc`.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options)
        .await?;

    tracing::debug!(max_connections, "Database pool initialized");
    Ok(pool)
}

/// Initialize a pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_pool_size()).await
}

/// Single-connection in-memory pool.
///
/// A memory database exists per connection, so the pool must never grow
/// beyond one. Intended for tests.
pub async fn init_memory_pool() -> Result<DbPool, sqlx::Error> {
    init_pool_with_size("sqlite::memory:", 1).await
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("Database migrations applied");
    Ok(())
}

/// Start a `BEGIN IMMEDIATE` transaction.
///
/// Deferred transactions that read before writing can deadlock when two of
/// them try to upgrade to the write lock at once; taking the lock up front
/// avoids that.
pub async fn begin_immediate(pool: &DbPool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction {
        conn,
        finished: false,
    })
}

/// Manual immediate transaction.
///
/// Must be finished with [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); a dropped unfinished transaction closes its
/// connection so the open transaction is never returned to the pool.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    async fn finish(&mut self, statement: &str) -> Result<(), sqlx::Error> {
        sqlx::query(statement).execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        self.finish("COMMIT").await
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        self.finish("ROLLBACK").await
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("immediate transaction dropped without commit or rollback");
            self.conn.close_on_drop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pool_applies_migrations() {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        for expected in ["sessions", "posts", "downloads", "metadata"] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }

    #[tokio::test]
    async fn immediate_transaction_rolls_back() {
        let pool = init_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mut tx = begin_immediate(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO sessions (id, target_type, target_value, config_hash, status, created_at, updated_at)
             VALUES ('s1', 'user', 'u', 'h', 'active', '2026-01-01T00:00:00+00:00', '2026-01-01T00:00:00+00:00')",
        )
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
