//! Durable session store over SQLite.
//!
//! One `StateManager` owns the pool for a database URL. Every public
//! operation is safe to call concurrently; multi-statement writes run in
//! `BEGIN IMMEDIATE` transactions and roll back completely on failure.

use parking_lot::RwLock;
use sqlx::Row;
use tracing::{debug, info};

use crate::database::models::{
    DownloadRecord, DownloadStatus, IntegrityReport, MetadataMap, MetadataValue, PostRecord,
    PostStatus, ResumeCounts, ResumeState, SessionRecord, SessionStatus,
};
use crate::database::{
    DbPool, ImmediateTransaction, begin_immediate, init_memory_pool, init_pool, run_migrations,
};
use crate::error::{Error, Result};
use crate::post::Post;

/// Default cap for [`StateManager::list_sessions`].
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Facade over the session, post, download and metadata tables.
///
/// Holds the database URL alongside the pool, so a closed manager
/// transparently reopens on the next operation. In-memory databases lose
/// their contents on reopen; reopen semantics are for file-backed URLs.
pub struct StateManager {
    url: String,
    pool: RwLock<DbPool>,
}

impl StateManager {
    /// Open (creating if missing) the database at `url` and apply migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = init_pool(url).await?;
        run_migrations(&pool).await?;
        Ok(Self {
            url: url.to_string(),
            pool: RwLock::new(pool),
        })
    }

    /// Open a private in-memory database. Intended for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = init_memory_pool().await?;
        run_migrations(&pool).await?;
        Ok(Self {
            url: "sqlite::memory:".to_string(),
            pool: RwLock::new(pool),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Release the pool. Safe to call twice; the next operation reopens.
    pub async fn close(&self) {
        let pool = self.pool.read().clone();
        if !pool.is_closed() {
            pool.close().await;
            debug!("State store closed");
        }
    }

    /// Current pool, reopening a fresh one if `close` was called.
    async fn pool(&self) -> Result<DbPool> {
        {
            let pool = self.pool.read();
            if !pool.is_closed() {
                return Ok(pool.clone());
            }
        }
        let fresh = init_pool(&self.url).await?;
        run_migrations(&fresh).await?;
        let mut guard = self.pool.write();
        if guard.is_closed() {
            *guard = fresh.clone();
        }
        debug!("State store reopened");
        Ok(guard.clone())
    }

    // ------------------------------------------------------------------
    // Sessions

    /// Create a new active session.
    ///
    /// Refuses while another active session exists for the same
    /// (target_type, target_value, config_hash) tuple. The session row and
    /// its seed metadata row are written in one transaction.
    pub async fn create_session(
        &self,
        target_type: &str,
        target_value: &str,
        config_hash: &str,
    ) -> Result<String> {
        let pool = self.pool().await?;
        let mut tx = begin_immediate(&pool).await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sessions
             WHERE target_type = ? AND target_value = ? AND config_hash = ? AND status = ?",
        )
        .bind(target_type)
        .bind(target_value)
        .bind(config_hash)
        .bind(SessionStatus::Active)
        .fetch_one(&mut *tx)
        .await?;
        if active > 0 {
            tx.rollback().await?;
            return Err(Error::DuplicateSession {
                target_type: target_type.to_string(),
                target_value: target_value.to_string(),
            });
        }

        let session = SessionRecord::new(target_type, target_value, config_hash);
        sqlx::query(
            "INSERT INTO sessions (id, target_type, target_value, config_hash, status, created_at, updated_at, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.target_type)
        .bind(&session.target_value)
        .bind(&session.config_hash)
        .bind(session.status)
        .bind(&session.created_at)
        .bind(&session.updated_at)
        .bind(&session.ended_at)
        .execute(&mut *tx)
        .await?;

        let created_by = MetadataValue::from(env!("CARGO_PKG_NAME"));
        sqlx::query(
            "INSERT INTO metadata (session_id, key, value, value_type, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind("created_by")
        .bind(created_by.encode()?)
        .bind(created_by.value_type())
        .bind(&session.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(session_id = %session.id, target_type, target_value, "Session created");
        Ok(session.id)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        let pool = self.pool().await?;
        sqlx::query_as::<_, SessionRecord>("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    /// Sessions newest first, optionally filtered.
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
        target_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SessionRecord>> {
        let pool = self.pool().await?;
        let rows = match (status, target_type) {
            (Some(status), Some(target_type)) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM sessions WHERE status = ? AND target_type = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status)
                .bind(target_type)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
            (Some(status), None) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM sessions WHERE status = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(status)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
            (None, Some(target_type)) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM sessions WHERE target_type = ?
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(target_type)
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
            (None, None) => {
                sqlx::query_as::<_, SessionRecord>(
                    "SELECT * FROM sessions ORDER BY created_at DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Set a session's status, stamping `ended_at` on terminal states and
    /// clearing it otherwise.
    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<()> {
        let pool = self.pool().await?;
        let now = chrono::Utc::now().to_rfc3339();
        let result = if status.is_terminal() {
            sqlx::query(
                "UPDATE sessions SET status = ?, updated_at = ?, ended_at = ? WHERE id = ?",
            )
            .bind(status)
            .bind(&now)
            .bind(&now)
            .bind(session_id)
            .execute(&pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE sessions SET status = ?, updated_at = ?, ended_at = NULL WHERE id = ?",
            )
            .bind(status)
            .bind(&now)
            .bind(session_id)
            .execute(&pool)
            .await?
        };
        if result.rows_affected() == 0 {
            return Err(Error::not_found("session", session_id));
        }
        info!(session_id, status = %status, "Session status updated");
        Ok(())
    }

    /// Delete a session and everything it owns.
    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let pool = self.pool().await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("session", session_id));
        }
        info!(session_id, "Session deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Posts

    /// Upsert one post.
    ///
    /// A new row gets `status`; an existing row keeps its status, attempts
    /// and error so progress survives re-discovery, only the payload is
    /// refreshed.
    pub async fn save_post(&self, session_id: &str, post: &Post, status: PostStatus) -> Result<()> {
        let pool = self.pool().await?;
        self.ensure_session(&pool, session_id).await?;
        let now = chrono::Utc::now().to_rfc3339();
        upsert_post(&pool, session_id, post, status, &now).await
    }

    /// Upsert a batch of pending posts in one transaction.
    pub async fn save_posts(&self, session_id: &str, posts: &[Post]) -> Result<u64> {
        let pool = self.pool().await?;
        self.ensure_session(&pool, session_id).await?;
        let now = chrono::Utc::now().to_rfc3339();
        let mut tx = begin_immediate(&pool).await?;
        for post in posts {
            let payload = serde_json::to_string(post)?;
            sqlx::query(
                "INSERT INTO posts (id, session_id, status, attempts, error, payload, created_at, updated_at)
                 VALUES (?, ?, ?, 0, NULL, ?, ?, ?)
                 ON CONFLICT (session_id, id)
                 DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
            )
            .bind(&post.id)
            .bind(session_id)
            .bind(PostStatus::Pending)
            .bind(payload)
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!(session_id, count = posts.len(), "Posts saved");
        Ok(posts.len() as u64)
    }

    pub async fn get_posts(
        &self,
        session_id: &str,
        status: Option<PostStatus>,
    ) -> Result<Vec<PostRecord>> {
        let pool = self.pool().await?;
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, PostRecord>(
                    "SELECT * FROM posts WHERE session_id = ? AND status = ? ORDER BY rowid",
                )
                .bind(session_id)
                .bind(status)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, PostRecord>(
                    "SELECT * FROM posts WHERE session_id = ? ORDER BY rowid",
                )
                .bind(session_id)
                .fetch_all(&pool)
                .await?
            }
        };
        Ok(rows)
    }

    pub async fn get_post(&self, session_id: &str, post_id: &str) -> Result<PostRecord> {
        let pool = self.pool().await?;
        sqlx::query_as::<_, PostRecord>("SELECT * FROM posts WHERE session_id = ? AND id = ?")
            .bind(session_id)
            .bind(post_id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| Error::not_found("post", post_id))
    }

    /// Move a post out of pending.
    ///
    /// Same-status re-marks are no-ops; anything else from a non-pending
    /// state is an invalid transition.
    pub async fn mark_post_processed(
        &self,
        session_id: &str,
        post_id: &str,
        status: PostStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let pool = self.pool().await?;
        let mut tx = begin_immediate(&pool).await?;
        let current: Option<PostStatus> =
            sqlx::query_scalar("SELECT status FROM posts WHERE session_id = ? AND id = ?")
                .bind(session_id)
                .bind(post_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Err(Error::not_found("post", post_id));
        };
        if current == status {
            tx.rollback().await?;
            return Ok(());
        }
        if !current.can_transition(status) {
            tx.rollback().await?;
            return Err(Error::transition(
                format!("post {post_id}"),
                current.to_string(),
                status.to_string(),
            ));
        }
        sqlx::query(
            "UPDATE posts SET status = ?, error = ?, attempts = attempts + 1, updated_at = ?
             WHERE session_id = ? AND id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(post_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(session_id, post_id, status = %status, "Post marked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Downloads

    /// Register a pending download row and return its id.
    pub async fn add_download(
        &self,
        session_id: &str,
        post_id: &str,
        url: &str,
        path: &str,
    ) -> Result<i64> {
        let pool = self.pool().await?;
        self.ensure_session(&pool, session_id).await?;
        let result = sqlx::query(
            "INSERT INTO downloads (session_id, post_id, url, path, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(post_id)
        .bind(url)
        .bind(path)
        .bind(DownloadStatus::Pending)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_download(&self, download_id: i64) -> Result<DownloadRecord> {
        let pool = self.pool().await?;
        sqlx::query_as::<_, DownloadRecord>("SELECT * FROM downloads WHERE id = ?")
            .bind(download_id)
            .fetch_optional(&pool)
            .await?
            .ok_or_else(|| Error::not_found("download", download_id.to_string()))
    }

    pub async fn get_downloads(
        &self,
        session_id: &str,
        status: Option<DownloadStatus>,
    ) -> Result<Vec<DownloadRecord>> {
        let pool = self.pool().await?;
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, DownloadRecord>(
                    "SELECT * FROM downloads WHERE session_id = ? AND status = ? ORDER BY id",
                )
                .bind(session_id)
                .bind(status)
                .fetch_all(&pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DownloadRecord>(
                    "SELECT * FROM downloads WHERE session_id = ? ORDER BY id",
                )
                .bind(session_id)
                .fetch_all(&pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Move a download to in-progress. Valid from pending or, for a retry,
    /// from failed; clears the previous error.
    pub async fn mark_download_started(&self, download_id: i64) -> Result<()> {
        let to = DownloadStatus::InProgress;
        let mut tx = self.begin_download_transition(download_id, to).await?;
        sqlx::query("UPDATE downloads SET status = ?, started_at = ?, error = NULL WHERE id = ?")
            .bind(to)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(download_id, status = %to, "Download marked");
        Ok(())
    }

    /// Move an in-progress download to completed with its final size and
    /// checksum.
    pub async fn mark_download_completed(
        &self,
        download_id: i64,
        file_size: u64,
        checksum: &str,
    ) -> Result<()> {
        let to = DownloadStatus::Completed;
        let mut tx = self.begin_download_transition(download_id, to).await?;
        sqlx::query(
            "UPDATE downloads SET status = ?, file_size = ?, checksum = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(to)
        .bind(file_size as i64)
        .bind(checksum)
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(download_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        debug!(download_id, status = %to, "Download marked");
        Ok(())
    }

    /// Mark a download failed with an explanatory message. Also valid from
    /// completed, which is how integrity repair records a vanished file.
    pub async fn mark_download_failed(&self, download_id: i64, error: &str) -> Result<()> {
        let to = DownloadStatus::Failed;
        let mut tx = self.begin_download_transition(download_id, to).await?;
        sqlx::query("UPDATE downloads SET status = ?, error = ?, finished_at = ? WHERE id = ?")
            .bind(to)
            .bind(error)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(download_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!(download_id, status = %to, "Download marked");
        Ok(())
    }

    /// Open a transaction and verify the transition is legal, leaving the
    /// status read and the update inside the same write lock.
    async fn begin_download_transition(
        &self,
        download_id: i64,
        to: DownloadStatus,
    ) -> Result<ImmediateTransaction> {
        let pool = self.pool().await?;
        let mut tx = begin_immediate(&pool).await?;
        let current: Option<DownloadStatus> =
            sqlx::query_scalar("SELECT status FROM downloads WHERE id = ?")
                .bind(download_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            tx.rollback().await?;
            return Err(Error::not_found("download", download_id.to_string()));
        };
        if !current.can_transition(to) {
            tx.rollback().await?;
            return Err(Error::transition(
                format!("download {download_id}"),
                current.to_string(),
                to.to_string(),
            ));
        }
        Ok(tx)
    }

    // ------------------------------------------------------------------
    // Metadata

    /// Upsert one typed metadata value.
    pub async fn set_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: &MetadataValue,
    ) -> Result<()> {
        let pool = self.pool().await?;
        self.ensure_session(&pool, session_id).await?;
        sqlx::query(
            "INSERT INTO metadata (session_id, key, value, value_type, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (session_id, key)
             DO UPDATE SET value = excluded.value, value_type = excluded.value_type,
                           updated_at = excluded.updated_at",
        )
        .bind(session_id)
        .bind(key)
        .bind(value.encode()?)
        .bind(value.value_type())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&pool)
        .await?;
        Ok(())
    }

    pub async fn get_metadata(&self, session_id: &str, key: &str) -> Result<Option<MetadataValue>> {
        let pool = self.pool().await?;
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT value, value_type FROM metadata WHERE session_id = ? AND key = ?",
        )
        .bind(session_id)
        .bind(key)
        .fetch_optional(&pool)
        .await?;
        row.map(|(value, value_type)| MetadataValue::decode(&value_type, &value))
            .transpose()
    }

    pub async fn get_all_metadata(&self, session_id: &str) -> Result<MetadataMap> {
        let pool = self.pool().await?;
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT key, value, value_type FROM metadata WHERE session_id = ? ORDER BY key",
        )
        .bind(session_id)
        .fetch_all(&pool)
        .await?;
        let mut map = MetadataMap::new();
        for (key, value, value_type) in rows {
            map.insert(key, MetadataValue::decode(&value_type, &value)?);
        }
        Ok(map)
    }

    // ------------------------------------------------------------------
    // Derived state

    /// Snapshot of what remains to be done, derived purely from row
    /// statuses.
    pub async fn resume_state(&self, session_id: &str) -> Result<ResumeState> {
        let session = self.get_session(session_id).await?;
        let pool = self.pool().await?;

        let rows: Vec<(PostStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM posts WHERE session_id = ? GROUP BY status",
        )
        .bind(session_id)
        .fetch_all(&pool)
        .await?;
        let mut counts = ResumeCounts::default();
        for (status, n) in rows {
            counts.total += n;
            match status {
                PostStatus::Pending => counts.pending += n,
                PostStatus::Processed => counts.processed += n,
                PostStatus::Skipped => counts.skipped += n,
                PostStatus::Failed => counts.failed += n,
            }
        }

        let pending_posts = self.get_posts(session_id, Some(PostStatus::Pending)).await?;
        let failed_downloads = self
            .get_downloads(session_id, Some(DownloadStatus::Failed))
            .await?;
        let can_resume = counts.pending > 0;

        Ok(ResumeState {
            session,
            pending_posts,
            failed_downloads,
            counts,
            can_resume,
        })
    }

    /// Database self-check: SQLite integrity, foreign keys, row counts.
    pub async fn integrity_report(&self) -> Result<IntegrityReport> {
        let pool = self.pool().await?;
        let mut issues = Vec::new();

        let integrity: Vec<(String,)> = sqlx::query_as("PRAGMA integrity_check")
            .fetch_all(&pool)
            .await?;
        for (line,) in &integrity {
            if line != "ok" {
                issues.push(format!("integrity: {line}"));
            }
        }

        let fk_rows = sqlx::query("PRAGMA foreign_key_check").fetch_all(&pool).await?;
        for row in &fk_rows {
            let table: String = row.try_get(0).unwrap_or_default();
            let parent: String = row.try_get(2).unwrap_or_default();
            issues.push(format!(
                "foreign key violation: {table} references missing {parent} row"
            ));
        }

        let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
            .fetch_one(&pool)
            .await?;
        let posts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM posts")
            .fetch_one(&pool)
            .await?;
        let downloads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM downloads")
            .fetch_one(&pool)
            .await?;
        let metadata_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata")
            .fetch_one(&pool)
            .await?;

        Ok(IntegrityReport {
            ok: issues.is_empty(),
            issues,
            sessions,
            posts,
            downloads,
            metadata_rows,
        })
    }

    async fn ensure_session(&self, pool: &DbPool, session_id: &str) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(pool)
            .await?;
        if exists.is_none() {
            return Err(Error::not_found("session", session_id));
        }
        Ok(())
    }
}

async fn upsert_post(
    pool: &DbPool,
    session_id: &str,
    post: &Post,
    status: PostStatus,
    now: &str,
) -> Result<()> {
    let payload = serde_json::to_string(post)?;
    sqlx::query(
        "INSERT INTO posts (id, session_id, status, attempts, error, payload, created_at, updated_at)
         VALUES (?, ?, ?, 0, NULL, ?, ?, ?)
         ON CONFLICT (session_id, id)
         DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
    )
    .bind(&post.id)
    .bind(session_id)
    .bind(status)
    .bind(payload)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
